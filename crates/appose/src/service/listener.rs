//! Inbound frame loop
//!
//! Holds only a weak reference to the service, so dropping every
//! [`Service`](super::Service) handle lets the listener wind down.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{ServiceInner, TaskError};
use crate::protocol::{FrameReader, Response};

pub(crate) fn spawn<R>(service: &Arc<ServiceInner>, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let weak = Arc::downgrade(service);
    let id = service.id.clone();
    let mut reader = FrameReader::with_max_len(reader, service.config.max_frame_len);

    tokio::spawn(async move {
        loop {
            let result = reader.recv::<Response>().await;
            let Some(service) = weak.upgrade() else {
                debug!("Service {} dropped, listener exiting", id);
                break;
            };

            match result {
                Ok(Some(Response::Crash { error })) => {
                    error!("Worker of service {} reported a fatal error: {}", id, error);
                    service.shut_down(TaskError::WorkerCrashed(error)).await;
                    break;
                }
                Ok(Some(response)) => {
                    if let Err(violation) = dispatch(&service, response) {
                        error!("Protocol violation on service {}: {}", id, violation);
                        service.shut_down(TaskError::Protocol(violation)).await;
                        break;
                    }
                }
                Ok(None) => {
                    let detail = service.exit_detail().await;
                    if service.is_closed() {
                        debug!("Service {} worker disconnected: {}", id, detail);
                    } else {
                        error!("Service {} worker disconnected unexpectedly: {}", id, detail);
                    }
                    service.shut_down(TaskError::WorkerCrashed(detail)).await;
                    break;
                }
                Err(e) if e.is_disconnect() => {
                    error!("Error reading from worker of service {}: {}", id, e);
                    let detail = format!("{e}; {}", service.exit_detail().await);
                    service.shut_down(TaskError::WorkerCrashed(detail)).await;
                    break;
                }
                Err(e) => {
                    error!("Malformed frame from worker of service {}: {}", id, e);
                    service.shut_down(TaskError::Protocol(e.to_string())).await;
                    break;
                }
            }
        }
    })
}

/// Route one frame to its task
fn dispatch(service: &ServiceInner, response: Response) -> Result<(), String> {
    let Some(task_id) = response.task() else {
        return Ok(());
    };

    // Clone out of the map so no shard lock is held while listeners run
    let task = service.tasks.get(&task_id).map(|entry| Arc::clone(entry.value()));
    let Some(task) = task else {
        warn!(
            "Dropping {} frame for unknown task {} on service {}",
            response.kind(),
            task_id,
            service.id
        );
        return Ok(());
    };

    if task.handle_response(response)? {
        service.tasks.remove(&task_id);
    }
    Ok(())
}
