//! FluvalSmart CLI
//!
//! 命令行客户端，直接通过本机蓝牙适配器控制灯具

mod session;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fluvalsmart_core::{BleEvent, BleSettings, LogLevel, Register, ScannedDevice};
use session::Session;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fluvalsmart", version, about = "Fluval 水族灯 BLE 命令行工具")]
struct Cli {
    /// 配置文件路径 (默认: <config_dir>/fluvalsmart/ble.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 提高日志级别 (可重复)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近灯具
    Scan {
        /// 扫描时间 (秒)
        #[arg(short, long, default_value = "12")]
        timeout: u64,
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 向灯具发送十六进制数据
    Send {
        /// 设备地址
        mac: String,
        /// 数据，例如 "68 02 01"
        hex: String,
        /// 连接超时 (秒)
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
    /// 连接灯具并打印收到的数据帧
    Monitor {
        mac: String,
        /// 监听时间 (秒)
        #[arg(short, long, default_value = "30")]
        duration: u64,
    },
    /// 读取广播厂商数据
    ReadMfr { mac: String },
    /// 读取设备名称
    ReadName { mac: String },
}

fn init_logging(level: LogLevel) {
    // 桥接 log crate（fluvalsmart-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default_filter = format!(
        "warn,fluvalsmart_core={0},fluvalsmart={0}",
        level.directive()
    );
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_settings(path: Option<&PathBuf>) -> Result<BleSettings> {
    match path {
        Some(path) => BleSettings::load_from(path)
            .with_context(|| format!("Failed to load settings from {:?}", path)),
        None => Ok(BleSettings::load()),
    }
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(&digits);

    if !digits.is_ascii() {
        bail!("Hex payload contains non-ASCII characters");
    }
    if digits.is_empty() || digits.len() % 2 != 0 {
        bail!("Hex payload must contain an even number of digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("Invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_ref())?;
    init_logging(settings.log_level.raised_by(cli.verbose));

    match cli.command {
        Commands::Scan { timeout, json } => scan(settings, timeout, json).await,
        Commands::Send { mac, hex, timeout } => {
            let payload = parse_hex(&hex)?;
            send(settings, &mac.to_uppercase(), &payload, timeout).await
        }
        Commands::Monitor { mac, duration } => {
            monitor(settings, &mac.to_uppercase(), duration).await
        }
        Commands::ReadMfr { mac } => {
            let mac = mac.to_uppercase();
            match read_register(settings, &mac, Register::ManufacturerData).await? {
                v if v.is_empty() => println!("{}: 无厂商数据", mac),
                v => println!("{}: {}", mac, v),
            }
            Ok(())
        }
        Commands::ReadName { mac } => {
            let mac = mac.to_uppercase();
            let name = read_register(settings, &mac, Register::DeviceName).await?;
            println!("{}: {}", mac, if name.is_empty() { "Unknown" } else { &name });
            Ok(())
        }
    }
}

async fn scan(settings: BleSettings, timeout: u64, json: bool) -> Result<()> {
    let mut session = Session::open(settings).await?;
    session.manager.set_scan_period(Duration::from_secs(timeout));

    if !json {
        println!("🔍 扫描灯具 ({}s)...", timeout);
    }
    session.manager.start_scan().await?;

    // 同一设备会多次上报，按地址去重保留最新一条
    let mut devices: BTreeMap<String, ScannedDevice> = BTreeMap::new();
    let deadline = Instant::now() + Duration::from_secs(timeout + 1);
    while let Some(event) = session.next_event(deadline).await {
        match event {
            BleEvent::DeviceScanned(device) => {
                if !json && !devices.contains_key(&device.mac) {
                    println!(
                        "   {} {} (RSSI: {})",
                        device.mac,
                        device.name.as_deref().unwrap_or("Unknown"),
                        device
                            .rssi
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
                devices.insert(device.mac.clone(), device);
            }
            BleEvent::ScanStopped => break,
            _ => {}
        }
    }

    if json {
        let list: Vec<_> = devices.into_values().collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else if devices.is_empty() {
        println!("   未发现设备");
    }

    session.close().await;
    Ok(())
}

async fn send(settings: BleSettings, mac: &str, payload: &[u8], timeout: u64) -> Result<()> {
    let mut session = Session::open(settings).await?;
    session.connect(mac, Duration::from_secs(timeout)).await?;

    println!("📤 发送 {} 字节到 {}", payload.len(), mac);
    let outcome = session.manager.send_bytes(mac, payload).await?.wait().await;
    session.close().await;

    if !outcome.is_complete() {
        bail!("Send incomplete: {:?}", outcome);
    }
    println!("   完成");
    Ok(())
}

async fn monitor(settings: BleSettings, mac: &str, duration: u64) -> Result<()> {
    let mut session = Session::open(settings).await?;
    session.connect(mac, Duration::from_secs(10)).await?;

    println!("📥 监听 {} ({}s)...", mac, duration);
    let deadline = Instant::now() + Duration::from_secs(duration);
    while let Some(event) = session.next_event(deadline).await {
        match event {
            BleEvent::DataReceived { mac: from, frame } if from == mac => {
                println!("   [{}] {}", frame.len(), format_hex(&frame));
            }
            BleEvent::DataInvalid(from) if from == mac => {
                println!("   设备已断开");
                break;
            }
            _ => {}
        }
    }

    session.close().await;
    Ok(())
}

/// 连接设备，发起一次寄存器读取并等待回复
async fn read_register(settings: BleSettings, mac: &str, register: Register) -> Result<String> {
    let mut session = Session::open(settings).await?;
    session.connect(mac, Duration::from_secs(10)).await?;
    match register {
        Register::ManufacturerData => session.manager.read_manufacturer_data(mac).await?,
        Register::DeviceName => session.manager.read_device_name(mac).await?,
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut value = None;
    while let Some(event) = session.next_event(deadline).await {
        if let BleEvent::RegisterRead {
            mac: from,
            register: r,
            value: v,
        } = event
        {
            if from == mac && r == register {
                value = Some(v);
                break;
            }
        }
    }
    session.close().await;

    value.with_context(|| format!("No {:?} reply from {}", register, mac))
}
