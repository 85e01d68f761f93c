use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    // 网络配置
    pub ws_url: String,
    pub api_key: String,
    pub model: String,

    // 助手配置
    pub voice_name: String,
    pub system_instruction: String,

    // 音频配置
    pub capture_device: String,
    pub playback_device: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Samples per captured frame (mono).
    pub frame_size: usize,
    pub playback_period_size: usize,
    /// Quiet period after the last buffer ends before leaving `Speaking`.
    pub speaking_debounce_ms: u64,
    /// RMS multiplier for the visualizer level, capped at 100.
    pub volume_gain: f32,

    // GUI进程配置
    pub gui_local_port: u16,
    pub gui_remote_port: u16,

    pub ledger_path: String,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            ws_url: env!("WS_URL").to_string(),
            api_key: env!("API_KEY").to_string(),
            model: env!("MODEL").to_string(),

            voice_name: env!("VOICE_NAME").to_string(),
            system_instruction: env!("SYSTEM_INSTRUCTION").to_string(),

            capture_device: env!("CAPTURE_DEVICE").to_string(),
            playback_device: env!("PLAYBACK_DEVICE").to_string(),
            input_sample_rate: env!("INPUT_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse INPUT_SAMPLE_RATE")?,
            output_sample_rate: env!("OUTPUT_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse OUTPUT_SAMPLE_RATE")?,
            frame_size: env!("FRAME_SIZE")
                .parse()
                .map_err(|_| "Failed to parse FRAME_SIZE")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE")
                .parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
            speaking_debounce_ms: env!("SPEAKING_DEBOUNCE_MS")
                .parse()
                .map_err(|_| "Failed to parse SPEAKING_DEBOUNCE_MS")?,
            volume_gain: env!("VOLUME_GAIN")
                .parse()
                .map_err(|_| "Failed to parse VOLUME_GAIN")?,

            gui_local_port: env!("GUI_LOCAL_PORT")
                .parse()
                .map_err(|_| "Failed to parse GUI_LOCAL_PORT")?,
            gui_remote_port: env!("GUI_REMOTE_PORT")
                .parse()
                .map_err(|_| "Failed to parse GUI_REMOTE_PORT")?,

            ledger_path: env!("LEDGER_PATH").to_string(),
        })
    }

    /// Build-time defaults, then `voice_ledger.toml` in the working directory
    /// (optional), then `VOICE_LEDGER_*` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Self::new().map_err(anyhow::Error::msg)?;
        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&defaults)?)
            .add_source(::config::File::with_name("voice_ledger").required(false))
            .add_source(::config::Environment::with_prefix("VOICE_LEDGER").try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!("API key is not configured (set VOICE_LEDGER_API_KEY)");
        }
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            anyhow::bail!("Sample rates must be greater than 0");
        }
        if self.frame_size == 0 {
            anyhow::bail!("Frame size must be greater than 0");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}
