use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    assistant: Assistant,
    audio: Audio,
    gui: Gui,
    ledger: Ledger,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct Assistant {
    voice_name: String,
    system_instruction: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    input_sample_rate: u32,
    output_sample_rate: u32,
    frame_size: usize,
    playback_period_size: usize,
    speaking_debounce_ms: u64,
    volume_gain: f32,
}

#[derive(Deserialize)]
struct Gui {
    local_port: u16,
    remote_port: u16,
}

#[derive(Deserialize)]
struct Ledger {
    path: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=API_KEY={}", config.network.api_key);
    println!("cargo:rustc-env=MODEL={}", config.network.model);

    println!("cargo:rustc-env=VOICE_NAME={}", config.assistant.voice_name);
    println!(
        "cargo:rustc-env=SYSTEM_INSTRUCTION={}",
        config.assistant.system_instruction.replace('\n', " ")
    );

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=INPUT_SAMPLE_RATE={}", config.audio.input_sample_rate);
    println!("cargo:rustc-env=OUTPUT_SAMPLE_RATE={}", config.audio.output_sample_rate);
    println!("cargo:rustc-env=FRAME_SIZE={}", config.audio.frame_size);
    println!(
        "cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}",
        config.audio.playback_period_size
    );
    println!(
        "cargo:rustc-env=SPEAKING_DEBOUNCE_MS={}",
        config.audio.speaking_debounce_ms
    );
    println!("cargo:rustc-env=VOLUME_GAIN={}", config.audio.volume_gain);

    // GUI 配置
    println!("cargo:rustc-env=GUI_LOCAL_PORT={}", config.gui.local_port);
    println!("cargo:rustc-env=GUI_REMOTE_PORT={}", config.gui.remote_port);

    println!("cargo:rustc-env=LEDGER_PATH={}", config.ledger.path);
}
