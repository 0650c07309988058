mod shell;

use anyhow::{Context, Result};
use shell::Command;
use std::io::{self, BufRead, Write};
use tracing::{info, warn};
use xreal_capture::CaptureMonitor;
use xreal_config::DriverConfig;
use xreal_vdisplay::headless::{HeadlessBuffers, HeadlessGpu, HeadlessHost};
use xreal_vdisplay::host::PropertyValue;
use xreal_vdisplay::{CreateRequest, VirtualDisplayManager, VirtualDisplayProvider};

type Manager = VirtualDisplayManager<HeadlessHost, HeadlessBuffers, HeadlessGpu>;

fn main() -> Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "xreal_vout=info,xreal_vdisplay=info,xreal_capture=info".into()
            }),
        )
        .init();

    // Load config.
    let config = xreal_config::load_config().unwrap_or_else(|e| {
        warn!(?e, "Failed to load config, using defaults");
        DriverConfig::default()
    });

    if std::env::args().any(|a| a == "--write-config") {
        xreal_config::save_config(&config)?;
        return Ok(());
    }

    info!(
        depth = config.display.depth,
        startup = config.startup.len(),
        "Virtual output shell starting"
    );

    // No display server here: run against the in-memory backend.
    let gpu = config.display.gpu_buffers.then(HeadlessGpu::new);
    let mut manager = VirtualDisplayManager::new(
        HeadlessHost::new(),
        HeadlessBuffers::new(),
        gpu,
        &config,
    );
    manager.attach();
    manager
        .post_screen_init()
        .context("Failed to bring up the control output")?;

    let startup: Vec<CreateRequest> = config
        .startup
        .iter()
        .map(|s| CreateRequest {
            name: s.name.clone(),
            width: s.width,
            height: s.height,
            refresh: s.refresh_or(config.outputs.default_refresh),
        })
        .collect();
    if !startup.is_empty() {
        match manager.create_displays(&startup) {
            Ok(displays) => info!(count = displays.len(), "Startup outputs created"),
            Err(e) => warn!(?e, "Startup outputs incomplete"),
        }
    }

    let mut monitor = CaptureMonitor::new();
    monitor.sync(&manager);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let command = match shell::parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        run(&mut manager, command);
        monitor.sync(&manager);
    }

    manager.remove_all()?;
    manager.detach();
    info!("Virtual output shell stopped");
    Ok(())
}

fn run(manager: &mut Manager, command: Command) {
    match command {
        Command::Control { property, value } => {
            let Some(control) = manager.control().output_id() else {
                println!("control output is not active");
                return;
            };
            let accepted =
                manager.set_output_property(control, property, &PropertyValue::String(value));
            println!("{}", if accepted { "ok" } else { "rejected" });
        }
        Command::Set {
            output,
            property,
            value,
        } => {
            let Some(id) = manager.lookup(&output).map(|v| v.output_id()) else {
                println!("no output named {output}");
                return;
            };
            let accepted = manager.set_output_property(id, &property, &value);
            println!("{}", if accepted { "ok" } else { "rejected" });
        }
        Command::Modeset { output, index } => match manager.set_output_mode(&output, index) {
            Ok(()) => println!("ok"),
            Err(e) => println!("{e}"),
        },
        Command::Dpms { output, mode } => match manager.set_output_dpms(&output, mode) {
            Ok(()) => println!("ok"),
            Err(e) => println!("{e}"),
        },
        Command::List => list(manager),
        Command::Help => println!("{}", shell::HELP),
        Command::Quit => {}
    }
}

fn list(manager: &Manager) {
    let mut any = false;
    for name in manager.output_names() {
        let Some(vout) = manager.lookup(&name) else {
            continue;
        };
        any = true;
        println!(
            "{name}: {} fb={} ar={} dpms={:?}",
            vout.current(),
            vout.framebuffer_id(),
            u8::from(vout.ar_mode()),
            vout.dpms_mode()
        );
        for (i, mode) in vout.modes().modes.iter().enumerate() {
            let mark = if i == vout.modes().preferred { '*' } else { ' ' };
            println!("  {mark}{i:>2} {} ({:.2} Hz)", mode.name, mode.vrefresh());
        }
    }
    if !any {
        println!("no virtual outputs");
    }
}
