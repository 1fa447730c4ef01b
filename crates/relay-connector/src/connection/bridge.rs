// Per-client bridge pump: application pipe → service connection.
//
// Pumps the handshake response first, then hub frames re-assembled across
// pipe segment boundaries, forwarding each complete record as connection
// data. Whichever of {application completion, transport loss} happens first
// decides the teardown ordering.
use bytes::{Bytes, BytesMut};
use relay_wire::{ServiceMessage, hub};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use crate::client::ClientConnectionContext;
use crate::config::BRIDGE_READ_CAPACITY;
use crate::connection::ServiceConnection;
use crate::error::ConnectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeOutcome {
    /// The application finished (pipe EOF or drain budget spent); the close
    /// is reported back to the service.
    AppCompleted,
    /// The service connection went away mid-forward.
    TransportClosed,
    /// Service-initiated disconnect or hub-triggered abort stopped the pump.
    Aborted,
    /// The application produced bytes that can never frame correctly.
    Faulted,
}

enum ForwardError {
    NotActive,
    Malformed(relay_wire::Error),
}

pub(crate) async fn run_client_bridge(
    connection: Arc<ServiceConnection>,
    context: Arc<ClientConnectionContext>,
) {
    let Some(mut service_read) = context.take_service_read() else {
        return;
    };
    let connection_id = context.connection_id().to_string();
    let close_timeout = connection.config().close_timeout();
    let mut buf = BytesMut::with_capacity(BRIDGE_READ_CAPACITY);
    let mut handshake_done = false;
    let mut app_done = false;
    let mut drain_deadline: Option<tokio::time::Instant> = None;

    let outcome = loop {
        // Forward every complete record already buffered before reading more.
        match forward_ready(&connection, &connection_id, &mut buf, &mut handshake_done).await {
            Ok(()) => {}
            Err(ForwardError::NotActive) => break BridgeOutcome::TransportClosed,
            Err(ForwardError::Malformed(err)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %err,
                    "unparseable application output; closing client"
                );
                break BridgeOutcome::Faulted;
            }
        }

        // The deadline arm only participates once the application finished.
        let far_future =
            || tokio::time::Instant::now() + Duration::from_secs(24 * 60 * 60);
        tokio::select! {
            read = service_read.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break BridgeOutcome::AppCompleted,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(
                            connection_id = %connection_id,
                            error = %err,
                            "application pipe read failed"
                        );
                        break BridgeOutcome::AppCompleted;
                    }
                }
            }
            _ = context.lifetime().cancelled(), if !app_done => {
                // Application finished first: bounded drain for whatever
                // output is still in the pipe, then stop.
                app_done = true;
                drain_deadline = Some(tokio::time::Instant::now() + close_timeout);
            }
            _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(far_future)),
                if drain_deadline.is_some() =>
            {
                tracing::warn!(
                    connection_id = %connection_id,
                    "client output drain timed out"
                );
                break BridgeOutcome::AppCompleted;
            }
            _ = context.aborted().cancelled() => break BridgeOutcome::Aborted,
        }
    };

    tracing::debug!(connection_id = %connection_id, ?outcome, "client bridge finished");
    let report_close = matches!(
        outcome,
        BridgeOutcome::AppCompleted | BridgeOutcome::Faulted
    );
    connection.perform_disconnect(&context, report_close).await;
}

async fn forward_ready(
    connection: &Arc<ServiceConnection>,
    connection_id: &str,
    buf: &mut BytesMut,
    handshake_done: &mut bool,
) -> Result<(), ForwardError> {
    if !*handshake_done {
        match hub::try_parse_handshake_response(buf) {
            Ok(Some((response, consumed))) => {
                if let Some(error) = &response.error {
                    tracing::debug!(
                        connection_id,
                        error,
                        "application rejected the client handshake"
                    );
                }
                // The response is relayed either way; the client decides.
                let record = buf.split_to(consumed).freeze();
                forward(connection, connection_id, record).await?;
                *handshake_done = true;
            }
            Ok(None) => return Ok(()),
            Err(err) => return Err(ForwardError::Malformed(err)),
        }
    }
    while *handshake_done {
        match hub::try_parse_message(buf) {
            Ok(Some(frame)) => {
                let record = buf.split_to(frame.consumed).freeze();
                forward(connection, connection_id, record).await?;
            }
            Ok(None) => break,
            Err(err) => return Err(ForwardError::Malformed(err)),
        }
    }
    Ok(())
}

async fn forward(
    connection: &Arc<ServiceConnection>,
    connection_id: &str,
    payload: Bytes,
) -> Result<(), ForwardError> {
    let message = ServiceMessage::ConnectionData {
        connection_id: connection_id.to_string(),
        payload,
        is_partial: false,
    };
    match connection.send_message(message).await {
        Ok(()) => Ok(()),
        Err(ConnectorError::ServiceConnectionNotActive) => Err(ForwardError::NotActive),
        Err(err) => {
            // Per-message recoverable: logged, dropped, pump continues.
            tracing::warn!(connection_id, error = %err, "forward failed; message dropped");
            metrics::counter!("relay_messages_dropped_total").increment(1);
            Ok(())
        }
    }
}
