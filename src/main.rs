//! # Greenhouse daemon entry point
//!
//! Loads the TOML configuration (first argument, default `config/greenhouse.toml`), starts
//! every activated controller and then serves a line console on stdin until `quit` or EOF.
//! `RUST_LOG` controls log verbosity.

use log::{error, info};
use std::{
    io::{BufRead, Write, stdin, stdout},
    process::ExitCode,
    sync::Arc,
};

use greenhouse_control::actuation::actions::DaemonControl;
use greenhouse_control::actuation::pid_controller::PidField;
use greenhouse_control::runtime::clock::SystemClock;
use greenhouse_control::{ConfigStore, ControlError, Result, Supervisor};

const DEFAULT_CONFIG: &str = "config/greenhouse.toml";

fn main() -> ExitCode {
    env_logger::init();
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());

    let supervisor = match ConfigStore::load(&path).and_then(|config| Supervisor::new(config, Arc::new(SystemClock))) {
        Ok(s) => s,
        Err(e) => {
            error!("Cannot start daemon with {}: {}", path, e);
            eprintln!("Cannot start daemon with {}: {}", path, e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = supervisor.start() {
        error!("Daemon start failed: {}", e);
        supervisor.shutdown();
        return ExitCode::FAILURE;
    }

    print_help();
    prompt();
    for line in stdin().lock().lines() {
        let Ok(line) = line else { break };
        match run_command(&supervisor, line.trim()) {
            Ok(Flow::Quit) => break,
            Ok(Flow::Continue) => {}
            Err(e) => println!("error: {}", e),
        }
        prompt();
    }

    supervisor.shutdown();
    info!("Exiting. Goodbye!");
    ExitCode::SUCCESS
}

enum Flow {
    Continue,
    Quit,
}

fn prompt() {
    print!("greenhouse> ");
    let _ = stdout().flush();
}

fn print_help() {
    println!("\n┌──────────────────────────────────────────────┐");
    println!("│  GREENHOUSE DAEMON CONSOLE                   │");
    println!("├──────────────────────────────────────────────┤");
    println!("│  status                                      │");
    println!("│  activate <id> | deactivate <id>             │");
    println!("│  pid-get <id> <field>                        │");
    println!("│  pid-set <id> <field> <value>                │");
    println!("│  pid-hold | pid-pause | pid-resume <id>      │");
    println!("│  force <id>                                  │");
    println!("│  help | quit                                 │");
    println!("└──────────────────────────────────────────────┘");
}

fn arg<'a>(args: &[&'a str], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .copied()
        .ok_or_else(|| ControlError::Config(format!("missing <{}>", name)))
}

fn run_command(supervisor: &Supervisor, line: &str) -> Result<Flow> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((command, args)) = parts.split_first() else {
        return Ok(Flow::Continue);
    };
    match *command {
        "status" => {
            let rows = supervisor.status();
            if rows.is_empty() {
                println!("no controllers running");
            }
            for row in rows {
                println!("{:<12} {:<24} {}", row.kind.to_string(), row.unique_id, row.state);
            }
        }
        "activate" => {
            supervisor.controller_activate(arg(args, 0, "id")?)?;
            println!("ok");
        }
        "deactivate" => {
            supervisor.controller_deactivate(arg(args, 0, "id")?)?;
            println!("ok");
        }
        "pid-get" => {
            let field: PidField = arg(args, 1, "field")?.parse()?;
            match supervisor.pid_get(arg(args, 0, "id")?, field)? {
                Some(value) => println!("{}", value),
                None => println!("none"),
            }
        }
        "pid-set" => {
            let field: PidField = arg(args, 1, "field")?.parse()?;
            let raw = arg(args, 2, "value")?;
            let value: f64 = raw
                .parse()
                .map_err(|_| ControlError::Config(format!("'{}' is not a number", raw)))?;
            supervisor.pid_set(arg(args, 0, "id")?, field, value)?;
            println!("ok");
        }
        "pid-hold" => {
            supervisor.pid_hold(arg(args, 0, "id")?)?;
            println!("ok");
        }
        "pid-pause" => {
            supervisor.pid_pause(arg(args, 0, "id")?)?;
            println!("ok");
        }
        "pid-resume" => {
            supervisor.pid_resume(arg(args, 0, "id")?)?;
            println!("ok");
        }
        "force" => {
            supervisor.input_force_measurement(arg(args, 0, "id")?)?;
            println!("ok");
        }
        "help" => print_help(),
        "quit" | "exit" => return Ok(Flow::Quit),
        other => println!("Unrecognized command '{}', type 'help'.", other),
    }
    Ok(Flow::Continue)
}
