use color_eyre::Result;

use ckb_cell_indexer::config::{load_dotenv, resolve_data_dir};

mod app;
mod cli;
mod errors;
mod logging;

fn main() -> Result<()> {
    errors::install_hooks()?;

    // Must run before the runtime starts worker threads
    let dotenv = load_dotenv(None);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(dotenv))
}

async fn run(dotenv: Option<std::path::PathBuf>) -> Result<()> {
    let args = cli::Args::parse_args();
    let data_dir = resolve_data_dir(args.data_dir.as_deref());

    logging::init(&data_dir)?;
    if let Some(path) = dotenv {
        tracing::debug!("Loaded environment from {}", path.display());
    }

    let mut app = app::App::new(&args, &data_dir).await?;

    app.run().await?;

    Ok(())
}
