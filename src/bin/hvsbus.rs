use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use hvsbus::config::BatteryConfig;
use hvsbus::registry::ValueRegistry;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const DEFAULT_HEARTBEAT_TOPIC: &str = "master/heartbeat";
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult {
    let matches = App::new("hvsbus")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Control client for the HVS battery emulator bridge")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Bridge host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Bridge port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("Stream everything the emulator publishes")
                .arg(
                    Arg::with_name("filter")
                        .help("Only show topics containing this text")
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("set")
                .about("Override a battery value")
                .arg(Arg::with_name("key").help("Value key, e.g. battery/soc").required(true).index(1))
                .arg(
                    Arg::with_name("value")
                        .help("New value")
                        .required(true)
                        .index(2)
                        .allow_hyphen_values(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("reset")
                .about("Restore a battery value to its default")
                .arg(Arg::with_name("key").help("Value key").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("heartbeat")
                .about("Send a master heartbeat")
                .arg(
                    Arg::with_name("every")
                        .long("every")
                        .value_name("SECONDS")
                        .help("Keep sending at this period until interrupted")
                        .takes_value(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(n) if n > 0 => Ok(()),
                            _ => Err("period must be a positive number of seconds".into()),
                        }),
                )
                .arg(
                    Arg::with_name("topic")
                        .long("topic")
                        .value_name("TOPIC")
                        .takes_value(true)
                        .default_value(DEFAULT_HEARTBEAT_TOPIC),
                ),
        )
        .subcommand(SubCommand::with_name("restart").about("Ask the emulator to restart"))
        .subcommand(SubCommand::with_name("keys").about("List the writable value keys and their defaults"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let format = matches.value_of("format").unwrap_or("table");

    match matches.subcommand() {
        ("watch", Some(sub)) => handle_watch(sub, host, port, format).await,
        ("set", Some(sub)) => {
            let key = sub.value_of("key").unwrap_or_default();
            let value = sub.value_of("value").unwrap_or_default();
            let reply = send_message(host, port, &format!("{key}/set"), value).await?;
            print_reply(&reply, format);
            Ok(())
        }
        ("reset", Some(sub)) => {
            let key = sub.value_of("key").unwrap_or_default();
            let reply = send_message(host, port, &format!("{key}/reset"), "").await?;
            print_reply(&reply, format);
            Ok(())
        }
        ("heartbeat", Some(sub)) => handle_heartbeat(sub, host, port, format).await,
        ("restart", _) => {
            let reply = send_message(host, port, "restart", "").await?;
            print_reply(&reply, format);
            Ok(())
        }
        ("keys", _) => {
            print_keys(format);
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let addr = format!("{host}:{port}");
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to emulator bridge at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Start it with:", "💡".yellow());
                eprintln!("   {}", "cargo run --bin hvsbus-simulator".bright_cyan());
            }
            Err(e.into())
        }
    }
}

/// Send one broker message and wait for the bridge's acknowledgement.
/// Published lines that arrive first are skipped.
async fn send_message(host: &str, port: u16, topic: &str, payload: &str) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let (reader, mut writer) = connect(host, port).await?.into_split();
    write_message(&mut writer, topic, payload).await?;

    match tokio::time::timeout(REPLY_TIMEOUT, read_ack(reader)).await {
        Ok(reply) => reply,
        Err(_) => {
            eprintln!("{} No reply within {} seconds", "⏰".yellow(), REPLY_TIMEOUT.as_secs());
            Err("reply timeout".into())
        }
    }
}

async fn write_message(writer: &mut OwnedWriteHalf, topic: &str, payload: &str) -> CliResult {
    let line = serde_json::json!({ "topic": topic, "payload": payload }).to_string();
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

async fn read_ack(reader: OwnedReadHalf) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        if value.get("action").is_some() || value.get("error").is_some() {
            return Ok(value);
        }
    }
    Err("bridge closed the connection".into())
}

async fn handle_watch(matches: &ArgMatches<'_>, host: &str, port: u16, format: &str) -> CliResult {
    let filter = matches.value_of("filter");
    let stream = connect(host, port).await?;
    let mut lines = BufReader::new(stream).lines();

    if format == "table" {
        println!("{}", format!("{:<40} {:>12}  {}", "TOPIC", "VALUE", "RETAIN").bright_white().bold());
    }

    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        let topic = message["topic"].as_str().unwrap_or_default();
        if filter.is_some_and(|f| !topic.contains(f)) {
            continue;
        }
        let payload = message["payload"].as_str().unwrap_or_default();
        let retain = message["retain"].as_bool().unwrap_or(false);

        match format {
            "json" => println!("{line}"),
            "compact" => println!("{topic}={payload}"),
            _ => println!("{:<40} {:>12}  {}", colour_topic(topic), payload.bright_white(), if retain { "R" } else { "" }),
        }
    }
    Ok(())
}

async fn handle_heartbeat(matches: &ArgMatches<'_>, host: &str, port: u16, format: &str) -> CliResult {
    let topic = matches.value_of("topic").unwrap_or(DEFAULT_HEARTBEAT_TOPIC);
    let Some(every) = matches.value_of("every").and_then(|v| v.parse::<u64>().ok()) else {
        let reply = send_message(host, port, topic, "1").await?;
        print_reply(&reply, format);
        return Ok(());
    };

    let (reader, mut writer) = connect(host, port).await?.into_split();
    // Published lines and acks are not interesting here, but must be read.
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    });
    let mut interval = tokio::time::interval(Duration::from_secs(every));
    println!("{} Sending heartbeat every {}s (Ctrl+C to stop)", "💓".red(), every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                write_message(&mut writer, topic, "1").await?;
                if format != "json" {
                    println!("{} heartbeat", "·".dimmed());
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn print_reply(reply: &serde_json::Value, format: &str) {
    match format {
        "json" => println!("{reply}"),
        "compact" => println!("{}", reply["action"].as_str().unwrap_or("error")),
        _ => {
            if let Some(error) = reply["error"].as_str() {
                println!("{} {}", "❌".red(), error.bright_red());
                return;
            }
            let topic = reply["topic"].as_str().unwrap_or_default();
            match reply["action"].as_str().unwrap_or_default() {
                "set" => println!(
                    "{} {} set to {}",
                    "✅".green(),
                    reply["key"].as_str().unwrap_or(topic).bright_white(),
                    reply["value"].to_string().bright_cyan()
                ),
                "reset" => println!(
                    "{} {} reset to default",
                    "✅".green(),
                    reply["key"].as_str().unwrap_or(topic).bright_white()
                ),
                "heartbeat" => println!("{} {}", "💓".red(), "Heartbeat delivered".bright_green()),
                "restart" => println!("{} {}", "🔄".yellow(), "Restart requested".bright_yellow()),
                "rejected" => {
                    println!("{} Value for {} is not a number", "❌".red(), topic.bright_white());
                }
                _ => {
                    println!("{} {} is not a known topic", "❓".blue(), topic.bright_white());
                    println!("{} See {}", "💡".yellow(), "hvsbus keys".bright_cyan());
                }
            }
        }
    }
}

fn print_keys(format: &str) {
    let registry = ValueRegistry::new(&BatteryConfig::default());
    match format {
        "json" => {
            let keys: serde_json::Map<String, serde_json::Value> = registry
                .bindings()
                .iter()
                .map(|b| (b.topic().to_string(), serde_json::json!(b.default_value)))
                .collect();
            println!("{}", serde_json::Value::Object(keys));
        }
        "compact" => {
            for binding in registry.bindings() {
                println!("{}", binding.topic());
            }
        }
        _ => {
            println!("{}", format!("{:<36} {:>10}", "KEY", "DEFAULT").bright_white().bold());
            for binding in registry.bindings() {
                println!("{:<36} {:>10.2}", colour_topic(binding.topic()), binding.default_value);
            }
        }
    }
}

fn colour_topic(topic: &str) -> ColoredString {
    if topic.contains("limits/") {
        topic.bright_yellow()
    } else if topic.contains("inverter/") {
        topic.bright_magenta()
    } else if topic.ends_with("log") {
        topic.dimmed()
    } else {
        topic.bright_cyan()
    }
}
