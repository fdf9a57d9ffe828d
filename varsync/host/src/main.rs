mod demo;
mod stdio;

use std::io;
use std::process;
use std::sync::mpsc;
use std::thread;

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use varsync_runtime::{
    Batch, CodecError, ObserverId, Session, SyncConfig, SyncError, WrapperRegistry,
};

const DEFAULT_FILTER: &str = "varsync=info";
const STDIO_OBSERVER: &str = "stdio";

#[derive(Debug, Error)]
enum HostError {
    #[error("failed to start: {0}")]
    Start(#[source] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

fn main() {
    init_tracing();

    if let Err(err) = run() {
        tracing::error!(error = %err, "varsync host fatal error");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<(), HostError> {
    let config = SyncConfig::from_env();
    let max_frame = config.max_frame;
    let session =
        Session::new(config, demo::runtime(), WrapperRegistry::default()).map_err(HostError::Start)?;
    let observer = ObserverId::from(STDIO_OBSERVER);

    let (tx, rx) = mpsc::channel::<Batch>();
    let replies = tx.clone();
    session
        .connect(observer.clone(), tx)
        .map_err(HostError::Start)?;

    let writer = thread::Builder::new()
        .name("varsync-stdout".to_string())
        .spawn(move || stdio::writer_loop(rx, io::stdout().lock(), max_frame))
        .map_err(HostError::Start)?;

    let read_result = serve(&session, &observer, io::stdin().lock(), max_frame, &replies);

    let released = session.disconnect(&observer)?;
    tracing::info!(session = session.label(), released = released.len(), "stdin closed");

    // The writer ends once every sender, including the batcher's, is gone.
    drop(replies);
    drop(session);
    match writer.join() {
        Ok(result) => result?,
        Err(_) => return Err(HostError::Panicked("writer")),
    }

    read_result?;
    Ok(())
}

/// Feeds inbound frames to the session until EOF. Frames that fail to decode
/// are answered with a `bad-request` error instead of closing the stream.
fn serve<R>(
    session: &Session<R>,
    observer: &ObserverId,
    input: impl io::Read,
    max_frame: usize,
    replies: &mpsc::Sender<Batch>,
) -> Result<(), CodecError>
where
    R: varsync_runtime::AppRuntime + Send + 'static,
{
    stdio::reader_loop(input, max_frame, |decoded| match decoded {
        Ok(batch) => {
            if let Err(err) = session.receive(observer, batch) {
                tracing::warn!(error = %err, "batch not processed");
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "undecodable frame");
            let reply = SyncError::BadRequest {
                id: 0,
                reason: err.to_string(),
            }
            .to_message();
            if replies.send(Batch::new(false, vec![reply])).is_err() {
                tracing::warn!("writer gone; error reply dropped");
            }
        }
    })
}
