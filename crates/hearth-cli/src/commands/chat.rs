//! Chat command - bring the session up and talk to the selected model.

use std::io::Write;

use hearth_local_ai::{ChatMessage, LlamaServerLauncher};
use hearth_session::{Session, SessionError, SessionSettings};
use tokio::sync::mpsc;

use super::open_session;

pub(crate) async fn run(
    settings: SessionSettings,
    message: Option<String>,
    reset: bool,
    stream: bool,
) -> miette::Result<()> {
    let binary = &settings.supervisor.server_binary;
    if !LlamaServerLauncher::new(binary).binary_exists() {
        return Err(miette::miette!(
            "Server binary not found at {}. Set HEARTH_SERVER_BIN to a llama-server build.",
            binary.display()
        ));
    }

    let session = open_session(settings)?;
    let result = chat(&session, message, reset, stream).await;
    session.dispose().await;
    result
}

async fn chat(
    session: &Session,
    message: Option<String>,
    reset: bool,
    stream: bool,
) -> miette::Result<()> {
    let mut errors = session.supervisor().errors();
    session
        .init()
        .await
        .map_err(|e| miette::miette!("Failed to start session: {}", e))?;

    let selected = session.selection().selected();
    if !selected.is_some_and(|model| session.registry().is_downloaded(&model.id)) {
        return Err(miette::miette!(
            "{}. Run `hearth model pull <id>` first.",
            SessionError::NoModelSelected
        ));
    }

    eprintln!("Waiting for the inference server...");
    tokio::select! {
        result = session.wait_ready() => {
            result.map_err(|e| miette::miette!("{}", e))?;
        }
        Ok(e) = errors.recv() => {
            return Err(miette::miette!("{}", e));
        }
    }

    let history = session.history();
    if reset {
        history
            .reset()
            .await
            .map_err(|e| miette::miette!("Failed to reset history: {}", e))?;
        println!("Conversation cleared.");
    }

    let Some(message) = message else {
        // The supervisor may already be replaying this turn.
        let reply = history
            .answer_pending()
            .await
            .map_err(|e| miette::miette!("Completion failed: {}", e))?;
        match reply {
            Some(ChatMessage { content, .. }) => println!("{}", content),
            None if !reset => println!("Nothing to reply to."),
            None => {}
        }
        return Ok(());
    };

    if stream {
        stream_reply(session, message).await?;
    } else {
        let reply = history
            .request_completion(Some(message))
            .await
            .map_err(|e| miette::miette!("Completion failed: {}", e))?;
        if let Some(ChatMessage { content, .. }) = reply {
            println!("{}", content);
        }
    }
    Ok(())
}

async fn stream_reply(
    session: &Session,
    message: String,
) -> miette::Result<Option<ChatMessage>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(fragment) = rx.recv().await {
            let _ = write!(stdout, "{}", fragment);
            let _ = stdout.flush();
        }
        let _ = writeln!(stdout);
    });

    let reply = session.history().stream_completion(Some(message), &tx).await;
    drop(tx);
    printer
        .await
        .map_err(|e| miette::miette!("Output task failed: {}", e))?;

    reply.map_err(|e| miette::miette!("Completion failed: {}", e))
}
