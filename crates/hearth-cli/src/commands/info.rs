//! Info command - show paths and settings.

use hearth_local_ai::LlamaServerLauncher;
use hearth_session::SessionSettings;

pub(crate) fn run(settings: &SessionSettings) -> miette::Result<()> {
    let supervisor = &settings.supervisor;
    let engine = &supervisor.engine;

    println!("Hearth {}", env!("CARGO_PKG_VERSION"));
    println!("============");
    println!();
    println!("Data directory:   {}", settings.data_dir.display());
    println!("Models directory: {}", settings.models_dir.display());
    println!("Catalog:          {}", settings.catalog_dir.display());
    println!("State:            {}", settings.state_dir.display());
    println!();
    println!("Server binary:    {}", supervisor.server_binary.display());
    println!(
        "  Exists: {}",
        LlamaServerLauncher::new(&supervisor.server_binary).binary_exists()
    );
    println!("Server address:   {}", settings.completion_url());
    println!();
    println!("Engine defaults:");
    println!("  Context length: {}", engine.ctx_len);
    println!("  GPU layers:     {}", engine.ngl);
    println!("  CPU threads:    {}", engine.cpu_threads);
    println!();
    println!("Supervisor:");
    println!("  Settle delay:   {:?}", supervisor.settle_delay);
    match supervisor.health_interval {
        Some(interval) => println!("  Health probe:   every {:?}", interval),
        None => println!("  Health probe:   off"),
    }
    if supervisor.max_restarts == 0 {
        println!("  Max restarts:   unlimited");
    } else {
        println!("  Max restarts:   {}", supervisor.max_restarts);
    }
    println!("  Stable after:   {:?}", supervisor.stable_after);

    Ok(())
}
