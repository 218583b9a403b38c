use std::collections::HashMap;
use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{error, info, warn};

use pktflow::{
    list_devices, load_known_hosts, AddressResolver, DnsLookup, LogSink, PcapSource, PipelineController,
    PipelineState, ResolverOptions, Settings,
};

fn main() -> Result<(), Box<dyn Error>> {
    let settings = Settings::new()?;

    env_logger::Builder::new()
        .parse_filters(&settings.log_level)
        .init();

    let resolver = build_resolver(&settings)?;
    let mut pipeline = PipelineController::new(settings.clone(), Arc::new(LogSink), resolver);

    if let Some(path) = &settings.replay_file {
        let source = PcapSource::open_file(path, settings.capture.filter.as_deref())?;
        pipeline.start_with_source(Box::new(source))?;
        println!("Replaying {}. Press Enter to stop early.", path);

        let stop = pipeline.stop_signal();
        thread::spawn(move || {
            let mut line = String::new();
            // EOF on stdin (e.g. redirected from /dev/null) must not cut the replay short.
            if matches!(io::stdin().read_line(&mut line), Ok(n) if n > 0) {
                stop.raise();
            }
        });

        let result = pipeline.wait();
        info!("Final stats: {}", pipeline.stats());
        return result.map_err(Into::into);
    }

    let interface = match &settings.interface {
        Some(name) => name.clone(),
        None => select_interface()?,
    };
    info!("Starting capture on {}...", interface);
    pipeline.start(&interface)?;
    println!("Capturing. Press Enter to stop.");

    // Enter on stdin requests a stop; a fatal capture error stops us too.
    let (stop_tx, stop_rx) = bounded::<()>(1);
    thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().read_line(&mut line);
        let _ = stop_tx.send(());
    });

    let stats_interval = Duration::from_secs(settings.stats_interval_secs.max(1));
    let mut last_report = Instant::now();
    loop {
        match stop_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if pipeline.state() == PipelineState::Stopping {
            warn!("Capture ended unexpectedly");
            break;
        }
        if last_report.elapsed() >= stats_interval {
            info!("Stats: {}", pipeline.stats());
            last_report = Instant::now();
        }
    }

    let result = pipeline.stop();
    info!("Final stats: {}", pipeline.stats());
    if let Err(e) = &result {
        error!("Capture error: {}", e);
    }
    result.map_err(Into::into)
}

fn build_resolver(settings: &Settings) -> Result<Option<Arc<AddressResolver>>, Box<dyn Error>> {
    if !settings.resolver.enabled {
        info!("Reverse name resolution disabled");
        return Ok(None);
    }
    let known_hosts = match &settings.known_hosts_file_path {
        Some(path) => load_known_hosts(path).unwrap_or_else(|e| {
            warn!("Ignoring known hosts file '{}': {}", path, e);
            HashMap::new()
        }),
        None => HashMap::new(),
    };
    let lookup = DnsLookup::new(Duration::from_millis(settings.resolver.timeout_ms))?;
    Ok(Some(Arc::new(AddressResolver::with_known_hosts(
        Arc::new(lookup),
        ResolverOptions::from(&settings.resolver),
        known_hosts,
    ))))
}

fn select_interface() -> Result<String, Box<dyn Error>> {
    info!("Finding network devices...");
    let devices = list_devices()?;

    if devices.is_empty() {
        error!("No network devices found. Try running with sudo or as an administrator");
        return Err("No network devices found.".into());
    }

    println!("Available network devices:");
    for (i, device) in devices.iter().enumerate() {
        match &device.desc {
            Some(desc) => println!("[{}] {} - {}", i, device.name, desc),
            None => println!("[{}] {}", i, device.name),
        }
    }

    loop {
        print!("Enter the number of the device to capture on: ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            return Err("No device selected.".into());
        }

        match input.trim().parse::<usize>() {
            Ok(index) => match devices.get(index) {
                Some(device) => return Ok(device.name.clone()),
                None => eprintln!("Invalid device number. Please try again."),
            },
            Err(_) => eprintln!("Please enter a valid number."),
        }
    }
}
