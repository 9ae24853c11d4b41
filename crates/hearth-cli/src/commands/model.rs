//! Model management commands.

use hearth_local_ai::DownloadProgress;
use hearth_session::{Session, SessionSettings};
use indicatif::{ProgressBar, ProgressStyle};

use super::open_session;

async fn open_models(settings: SessionSettings) -> miette::Result<Session> {
    let session = open_session(settings)?;
    session
        .init_models()
        .await
        .map_err(|e| miette::miette!("Failed to load models: {}", e))?;
    Ok(session)
}

/// List models in the catalog.
pub(crate) async fn list(settings: SessionSettings) -> miette::Result<()> {
    let session = open_models(settings).await?;
    let registry = session.registry();
    let models = registry.models();

    if models.is_empty() {
        println!("No models in the catalog.");
        println!();
        println!("Add model descriptors to: {}", registry.catalog_dir().display());
        session.dispose().await;
        return Ok(());
    }

    let selected = session.selection().selected_id();
    println!("Models:");
    for model in models {
        let marker = if selected.as_deref() == Some(model.id.as_str()) {
            "*"
        } else {
            " "
        };
        let status = if registry.is_downloaded(&model.id) {
            "downloaded"
        } else {
            "not downloaded"
        };
        println!(" {} {:<24} {:<32} {}", marker, model.id, model.name, status);
    }

    println!();
    println!("Models directory: {}", registry.models_root().display());

    session.dispose().await;
    Ok(())
}

/// Download a model and select it.
pub(crate) async fn pull(settings: SessionSettings, id: &str) -> miette::Result<()> {
    let session = open_models(settings).await?;
    let result = pull_model(&session, id).await;
    session.dispose().await;
    result
}

async fn pull_model(session: &Session, id: &str) -> miette::Result<()> {
    let model = session
        .registry()
        .find(id)
        .ok_or_else(|| miette::miette!("Unknown model: {}", id))?;

    if session.registry().is_downloaded(id) {
        println!("Model '{}' is already downloaded.", model.name);
    } else {
        println!("Downloading model: {}", model.name);
    }

    let mut download = session
        .selection()
        .use_model(model.clone())
        .await
        .map_err(|e| miette::miette!("Failed to start download: {}", e))?;

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {bytes} downloaded")
            .map_err(|e| miette::miette!("Invalid progress bar template: {}", e))?,
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelled = false;

    loop {
        tokio::select! {
            progress = download.progress() => match progress {
                Some(progress) => show_progress(&bar, &progress)?,
                None => break,
            },
            _ = &mut ctrl_c, if !cancelled => {
                cancelled = true;
                bar.set_message("cancelling");
                session.selection().cancel_download();
            }
        }
    }

    match download.finish().await {
        Ok(model) => {
            bar.finish_and_clear();
            session.registry().refresh().await;
            println!("Selected model: {}", model.name);
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            Err(miette::miette!("Failed to download model: {}", e))
        }
    }
}

fn show_progress(bar: &ProgressBar, progress: &DownloadProgress) -> miette::Result<()> {
    if let (Some(total), None) = (progress.bytes_total, bar.length()) {
        bar.set_length(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                )
                .map_err(|e| miette::miette!("Invalid progress bar template: {}", e))?
                .progress_chars("#>-"),
        );
    }
    bar.set_position(progress.bytes_transferred);
    Ok(())
}

/// Delete a downloaded model.
pub(crate) async fn remove(settings: SessionSettings, id: &str) -> miette::Result<()> {
    let session = open_models(settings).await?;
    let result = session
        .registry()
        .remove(id)
        .await
        .map_err(|e| miette::miette!("Failed to remove model '{}': {}", id, e));
    session.dispose().await;
    result?;

    println!("Removed model: {}", id);
    Ok(())
}
