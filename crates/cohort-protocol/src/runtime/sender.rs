/// Outbound sender loop.
///
/// Drains the channel's two queues (dispatcher control traffic first, then
/// role traffic), stamps the sender address, encodes and transmits under
/// the retry policy. Failures that need a membership or session repair are
/// reported back to the dispatcher rather than handled here.
use std::sync::Arc;

use cohort_transport::{SessionHandle, Transport, TransportError};
use tokio::sync::{mpsc, watch};

use super::{Internal, Outbound, Route, SenderInput};
use crate::retry::RetryPolicy;
use crate::types::{Address, GroupName};

pub(super) struct SenderLoop {
    pub transport: Arc<dyn Transport>,
    pub local: Address,
    pub group: GroupName,
    pub session: watch::Receiver<Option<SessionHandle>>,
    pub retry: RetryPolicy,
    pub internal: mpsc::UnboundedSender<Internal>,
}

impl SenderLoop {
    pub(super) async fn run(
        self,
        mut control: mpsc::UnboundedReceiver<SenderInput>,
        mut application: mpsc::Receiver<Outbound>,
    ) {
        loop {
            tokio::select! {
                biased;
                input = control.recv() => match input {
                    Some(SenderInput::Send(outbound)) => self.transmit(outbound).await,
                    Some(SenderInput::Flush(ack)) => {
                        while let Ok(outbound) = application.try_recv() {
                            self.transmit(outbound).await;
                        }
                        let _ = ack.send(());
                    }
                    // dispatcher is gone
                    None => break,
                },
                Some(outbound) = application.recv() => self.transmit(outbound).await,
            }
        }
        tracing::trace!(group = %self.group, "sender loop stopped");
    }

    async fn transmit(&self, outbound: Outbound) {
        let Outbound { route, mut message } = outbound;
        let Some(handle) = self.session.borrow().clone() else {
            tracing::debug!(group = %self.group, reason = ?message.reason, "no session, dropping outbound message");
            return;
        };

        message.sender = Some(self.local.clone());
        match &route {
            Route::Unicast(to) => message.addresses = vec![to.clone()],
            Route::Multicast(to) => message.addresses = to.clone(),
            Route::Broadcast | Route::Control => {}
        }
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(group = %self.group, "failed to encode outbound message: {e}");
                return;
            }
        };

        let transport: &dyn Transport = &*self.transport;
        let (session, data) = (&handle, bytes.as_slice());
        let result = match &route {
            Route::Unicast(to) => {
                self.retry
                    .run("send_unicast", move || transport.send_unicast(session, data, to))
                    .await
            }
            Route::Multicast(to) => {
                self.retry
                    .run("send_multicast", move || transport.send_multicast(session, data, to))
                    .await
            }
            Route::Broadcast => {
                self.retry
                    .run("send_broadcast", move || transport.send_broadcast(session, data))
                    .await
            }
            Route::Control => {
                self.retry
                    .run("send_control", move || transport.send_control(session, data))
                    .await
            }
        };

        let Err(exhausted) = result else {
            return;
        };
        let report = match exhausted.source {
            TransportError::UnknownRecipient { address } => {
                tracing::debug!(group = %self.group, %address, "recipient no longer in session");
                Internal::StaleRecipient(address)
            }
            error => {
                tracing::warn!(
                    group = %self.group,
                    attempts = exhausted.attempts,
                    "send failed: {error}"
                );
                Internal::SendFailed {
                    session: handle.clone(),
                    error,
                }
            }
        };
        let _ = self.internal.send(report);
    }
}
