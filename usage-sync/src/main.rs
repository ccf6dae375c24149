use std::time::Duration;

fn main() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("usage-sync: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(usage_sync_lib::run());

    // The stdin reader may still be parked in a blocking read
    runtime.shutdown_timeout(Duration::from_secs(1));

    if let Err(e) = result {
        eprintln!("usage-sync: {e}");
        std::process::exit(1);
    }
}
