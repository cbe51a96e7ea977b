use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use smartcloset::accessory::{self, Accessory};
use smartcloset::actuator::{ActuatorLink, HardwareCommand, LinkProbe, RecordingLink, SerialLink};
use smartcloset::agent::{AgentComponents, ClosetAgent};
use smartcloset::bridge::BridgeSender;
use smartcloset::config::Settings;
use smartcloset::events::Event;
use smartcloset::weather::{evaluate, WeatherMetrics};
use std::io::BufRead;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("smartcloset")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🧥 Smart closet - raises what you need for today's weather")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("YAML configuration file")
                .takes_value(true)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("🚀 Run the closet")
                .long_about("Starts presence monitoring, weather polling and the actuator coordinator. Type 'arrive' or 'leave' on stdin to simulate a person.")
                .arg(
                    Arg::with_name("dry-run")
                        .long("dry-run")
                        .help("Record actuator commands in memory instead of opening the serial port"),
                )
                .arg(
                    Arg::with_name("no-camera")
                        .long("no-camera")
                        .help("Do not take a picture after retracting"),
                ),
        )
        .subcommand(
            SubCommand::with_name("evaluate")
                .about("🌦️  Show which accessories a weather snapshot calls for")
                .arg(metric_arg("temp", "Current temperature (°C)"))
                .arg(metric_arg("precipitation", "Chance of precipitation (%)"))
                .arg(metric_arg("uv", "UV index"))
                .arg(metric_arg("dust", "Fine dust grade, e.g. 보통 or 나쁨"))
                .arg(metric_arg("humidity", "Relative humidity (%)")),
        )
        .subcommand(
            SubCommand::with_name("send")
                .about("🔧 Send one actuator command to the board")
                .arg(
                    Arg::with_name("opcode")
                        .help("0 to retract all, or actuator digits such as 134")
                        .required(true)
                        .validator(|v| match parse_opcode(&v) {
                            Some(_) => Ok(()),
                            None => Err("opcode must be 0 or digits 1-9".into()),
                        }),
                ),
        )
        .subcommand(SubCommand::with_name("config").about("📋 Print the effective configuration"))
        .get_matches();

    let settings = Settings::load(matches.value_of("config").map(Path::new))?;
    init_tracing(&settings.log_level);

    match matches.subcommand() {
        ("run", Some(sub_matches)) => handle_run(sub_matches, &settings).await?,
        ("evaluate", Some(sub_matches)) => handle_evaluate(sub_matches, &settings),
        ("send", Some(sub_matches)) => handle_send(sub_matches, &settings).await?,
        ("config", _) => print!("{}", serde_yaml::to_string(&settings)?),
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Run without hardware", "smartcloset run --dry-run".bright_cyan());
            println!("  {} Try the weather rules", "smartcloset evaluate --precipitation 80".bright_cyan());
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn metric_arg<'a>(name: &'a str, help: &'a str) -> Arg<'a, 'a> {
    Arg::with_name(name)
        .long(name)
        .value_name("VALUE")
        .help(help)
        .takes_value(true)
}

fn parse_opcode(raw: &str) -> Option<HardwareCommand> {
    let raw = raw.trim();
    if raw == "0" {
        return Some(HardwareCommand::RetractAll);
    }
    let mut digits = Vec::with_capacity(raw.len());
    for c in raw.chars() {
        digits.push(c.to_digit(10).filter(|d| *d > 0)? as u8);
    }
    HardwareCommand::deploy(digits)
}

async fn handle_run(matches: &ArgMatches<'_>, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let mut components = AgentComponents::from_settings(settings);
    let mut probe: Option<LinkProbe> = None;
    if matches.is_present("dry-run") {
        let link = RecordingLink::new();
        probe = Some(link.probe());
        components = components.with_link(Box::new(link));
        println!("{}", "Dry run: actuator commands are recorded, not sent".yellow());
    }
    if matches.is_present("no-camera") {
        components = components.without_camera();
    }

    let mut agent = ClosetAgent::new(settings, components);
    agent.start().await?;

    println!("{}", "🧥 Smart closet running".bright_green().bold());
    println!("{} {}", "Actuator link:".bright_white(), settings.serial.port.bright_cyan());
    println!(
        "{} {}",
        "Commands:".bright_white(),
        "arrive | leave | quit (Ctrl+C to stop)".dimmed()
    );

    let (quit_tx, mut quit_rx) = mpsc::unbounded_channel::<()>();
    spawn_console(agent.bridge(), quit_tx);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
        _ = quit_rx.recv() => {}
    }

    info!("Shutdown requested");
    let state = agent.get_state().await;
    if let Err(e) = agent.shutdown().await {
        warn!("Shutdown was not clean: {}", e);
    }

    println!("\n{}", "📊 Session".bright_blue().bold());
    println!("Uptime: {}s", state.uptime_seconds);
    println!("Weather evaluations: {}", state.weather_evaluations.to_string().bright_cyan());
    println!("Actuator commands: {}", state.coordinator.commands_sent.to_string().bright_cyan());
    println!("Suppressed requests: {}", state.coordinator.suppressed_requests);
    println!("Dropped requests: {}", state.coordinator.dropped_requests);
    println!("Captures: {}", state.captures);
    if let Some(probe) = probe {
        println!("Recorded opcodes: {}", probe.sent().join(" ").bright_cyan());
    }
    Ok(())
}

/// Reads stdin on a plain thread and hands presence events to the bus.
fn spawn_console(bridge: BridgeSender, quit: mpsc::UnboundedSender<()>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let event = match line.trim() {
                "arrive" | "a" => Event::presence_arrived(None),
                "leave" | "l" => Event::presence_left(None),
                "quit" | "q" => break,
                "" => continue,
                other => {
                    println!("{} unknown command '{}'", "❓".blue(), other);
                    continue;
                }
            };
            if bridge.send(event.with_source("console")).is_err() {
                break;
            }
        }
        let _ = quit.send(());
    });
}

fn handle_evaluate(matches: &ArgMatches<'_>, settings: &Settings) {
    let value = |name: &str| matches.value_of(name).map(ToString::to_string);
    let metrics = WeatherMetrics {
        current_temp: value("temp"),
        precipitation: value("precipitation"),
        uv_index: value("uv"),
        dust: value("dust"),
        humidity: value("humidity"),
    };

    let needed = evaluate(&metrics, &settings.weather.thresholds);

    println!("{}", "🌦️  Weather".bright_blue().bold());
    let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    println!("Temperature: {}", show(&metrics.current_temp));
    println!("Precipitation: {}", show(&metrics.precipitation));
    println!("UV index: {}", show(&metrics.uv_index));
    println!("Dust: {}", show(&metrics.dust));
    println!("Humidity: {}", show(&metrics.humidity));

    println!("\n{}", "🧥 Accessories".bright_blue().bold());
    for item in Accessory::ALL {
        if needed.contains(&item) {
            println!("{} {}", "✅".green(), item.as_str().bright_white());
        } else {
            println!("{} {}", "·".dimmed(), item.as_str().dimmed());
        }
    }

    let translation = settings.actuator.mapping.translate(&needed);
    let command = HardwareCommand::deploy(translation.indices.iter().copied())
        .unwrap_or(HardwareCommand::RetractAll);
    println!(
        "\n{} {} ({})",
        "Opcode:".bright_white(),
        command.opcode().as_str().bright_cyan(),
        accessory::describe(&translation.mapped)
    );
}

async fn handle_send(matches: &ArgMatches<'_>, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let command = matches
        .value_of("opcode")
        .and_then(parse_opcode)
        .ok_or("invalid opcode")?;

    let mut link = SerialLink::new(&settings.serial.port, settings.serial.baud_rate);
    if let Err(e) = link.open().await {
        eprintln!("{} {}", "❌".red(), e.to_string().bright_red());
        eprintln!("{} Check serial.port or CLOSET_SERIAL_PORT", "💡".yellow());
        return Err(e.into());
    }
    tokio::time::sleep(Duration::from_millis(settings.actuator.startup_settle_ms)).await;

    link.send_line(&command.opcode()).await?;
    println!("{} sent {}", "✅".green(), command.opcode().as_str().bright_cyan());

    match link.read_response(Duration::from_millis(settings.serial.timeout_ms)).await {
        Some(response) => println!("{} {}", "Board:".bright_white(), response),
        None => println!("{}", "No response from board".dimmed()),
    }
    link.close().await?;
    Ok(())
}
