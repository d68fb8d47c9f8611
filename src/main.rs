use cdl_parcels::cli::Args;
use cdl_parcels::error::CdlError;
use cdl_parcels::{logging, orchestrator};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_file = match logging::init(&args.log_folder, &args.layer_name, args.verbose) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Failed to set up logging in {}: {}", args.log_folder.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let start = Instant::now();
    info!("=== CDL Parcel Summaries ===");
    info!("Start time: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    info!("Logging to {}", log_file.display());
    info!("Arguments: {:?}", args);

    // Set thread pool size if specified
    if let Some(n_threads) = args.threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build_global()
        {
            error!("Failed to build thread pool: {}", e);
            return ExitCode::FAILURE;
        }
        info!("Using {} threads", n_threads);
    } else {
        info!("Using all available threads");
    }

    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let interrupt = Arc::clone(&interrupt);
        if let Err(e) = ctrlc::set_handler(move || {
            interrupt.store(true, Ordering::SeqCst);
        }) {
            warn!("Could not install interrupt handler: {}", e);
        }
    }

    let result = args
        .to_config()
        .and_then(|config| orchestrator::run(&config, &interrupt));
    let elapsed = format_elapsed(start.elapsed());

    match result {
        Ok(report) => {
            info!("=== Done! ===");
            info!("Total elapsed time: {}", elapsed);
            match report.output {
                Some(output) => info!("Output saved to {}", output.display()),
                None => info!("Merge skipped; chunk outputs are in {}", args.summary_folder.display()),
            }
            ExitCode::SUCCESS
        }
        Err(CdlError::Interrupted) => {
            warn!("Run interrupted by operator");
            info!("Total elapsed time: {}", elapsed);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            error!("Total elapsed time: {}", elapsed);
            error!("There was an error. Please check the log file at {}", log_file.display());
            ExitCode::FAILURE
        }
    }
}
