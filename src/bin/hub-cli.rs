//! Command-line access to a MegaHub over BLE.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin hub-cli --features ble-host -- [--name <filter>] [--config <file.json>] <command>
//! ```
//!
//! Commands:
//! - `projects` - list stored projects
//! - `cat <project> <file>` - print a project file
//! - `run <file.lua>` - run a local Lua script
//! - `stop` - stop the running program
//! - `check <file.lua>` - syntax-check a local Lua script
//! - `autostart [project]` - show or set the autostart project
//! - `monitor` - print log and port status events until Ctrl+C

#[cfg(feature = "ble-host")]
const USAGE: &str = "\
Usage: hub-cli [--name <filter>] [--config <file.json>] <command>

Commands:
  projects               List stored projects
  cat <project> <file>   Print a project file
  run <file.lua>         Run a local Lua script
  stop                   Stop the running program
  check <file.lua>       Syntax-check a local Lua script
  autostart [project]    Show or set the autostart project
  monitor                Print log and port status events until Ctrl+C";

#[cfg(feature = "ble-host")]
struct Args {
    name: Option<String>,
    config: Option<String>,
    command: Vec<String>,
}

#[cfg(feature = "ble-host")]
fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        name: None,
        config: None,
        command: Vec::new(),
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--name" => {
                args.name = Some(iter.next().ok_or("--name requires a value")?);
            }
            "--config" => {
                args.config = Some(iter.next().ok_or("--config requires a value")?);
            }
            "-h" | "--help" => return Err(String::new()),
            _ => args.command.push(arg),
        }
    }
    if args.command.is_empty() {
        return Err("missing command".to_string());
    }
    Ok(args)
}

#[cfg(feature = "ble-host")]
fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

#[cfg(feature = "ble-host")]
fn read_script(path: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(script) => script,
        Err(e) => fail(format!("cannot read {}: {}", path, e)),
    }
}

#[cfg(feature = "ble-host")]
#[tokio::main]
async fn main() {
    use std::io::Write;

    use log::info;
    use megahub_ble::{BleClient, BtleplugConnector, ClientConfig, HubClient, HubEvent, ScanConfig};

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("Error: {}\n", msg);
            }
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };

    let config = match &args.config {
        Some(path) => {
            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(e) => fail(format!("cannot read {}: {}", path, e)),
            };
            ClientConfig::from_json_str(&text).unwrap_or_else(|e| fail(e))
        }
        None => ClientConfig::default(),
    };
    let scan = ScanConfig {
        name_filter: args.name.clone(),
        ..Default::default()
    };

    let client = BleClient::new(BtleplugConnector::new(scan), config).unwrap_or_else(|e| fail(e));
    let hub = HubClient::new(client);

    let command: Vec<&str> = args.command.iter().map(String::as_str).collect();
    let monitor = command == ["monitor"];

    let disconnected = std::sync::Arc::new(tokio::sync::Notify::new());
    if monitor {
        hub.on_event(|event| {
            match event {
                HubEvent::Log(line) => println!("[log] {}", line),
                HubEvent::PortStatus(status) => println!("[port] {}", status),
                _ => {}
            }
            Ok(())
        });
        let notify = disconnected.clone();
        hub.client().on_disconnect(move || notify.notify_one());
    }

    info!("Connecting to hub...");
    let connected = if monitor {
        hub.connect().await
    } else {
        hub.client().connect().await.map_err(Into::into)
    };
    if let Err(e) = connected {
        fail(e);
    }
    if let Some(mtu) = hub.client().mtu() {
        info!("Connected, MTU {}", mtu);
    }

    let outcome = match command.as_slice() {
        ["projects"] => hub.get_projects().await.map(|projects| {
            for project in projects {
                println!("{}", project.name);
            }
        }),
        ["cat", project, file] => hub.get_project_file(project, file).await.map(|content| {
            let mut stdout = std::io::stdout();
            if let Err(e) = stdout.write_all(&content).and_then(|_| stdout.flush()) {
                fail(e);
            }
        }),
        ["run", path] => hub.run_program(&read_script(path)).await,
        ["stop"] => hub.stop_program().await,
        ["check", path] => hub.syntax_check(&read_script(path)).await.map(|check| {
            if check.success {
                println!("OK ({} ms)", check.parse_time);
            } else {
                println!("{}", check.error_message);
                std::process::exit(2);
            }
        }),
        ["autostart"] => hub.get_autostart().await.map(|project| match project {
            Some(project) => println!("{}", project),
            None => println!("(none)"),
        }),
        ["autostart", project] => hub.put_autostart(project).await,
        ["monitor"] => {
            println!("Monitoring events (Ctrl+C to exit)...");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = disconnected.notified() => eprintln!("Hub disconnected"),
            }
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };

    let _ = hub.client().disconnect().await;
    if let Err(e) = outcome {
        fail(e);
    }
}

#[cfg(not(feature = "ble-host"))]
fn main() {
    eprintln!("hub-cli needs the host BLE adapter.");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  cargo run --bin hub-cli --features ble-host -- <command>");
    std::process::exit(1);
}
