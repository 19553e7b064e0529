// ========== Dispatch Client ==========

use func_lib::{
    BusReply, Envelope, FnError, FnResult, InvokeRequest, HEADER_MSG, HEADER_TRACE_ID,
    REPLY_CODE_OK,
};
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bus::MessageBus;

/// Lifecycle of one call. The last three are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Building,
    Sent,
    AwaitingReply,
    Succeeded,
    TimedOut,
    RemoteError,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Succeeded | CallState::TimedOut | CallState::RemoteError
        )
    }

    /// Terminal state for a finished call. Failures that never got a reply
    /// (transport, cancellation, bad input) have none.
    pub fn of(result: &FnResult<Envelope>) -> Option<CallState> {
        match result {
            Ok(_) => Some(CallState::Succeeded),
            Err(FnError::TimedOut(_)) => Some(CallState::TimedOut),
            Err(FnError::RemoteError { .. }) => Some(CallState::RemoteError),
            Err(_) => None,
        }
    }
}

struct Call {
    trace_id: String,
    subject: String,
    state: CallState,
    started: Instant,
}

impl Call {
    fn advance(&mut self, next: CallState) {
        debug!(
            "call {} on {}: {:?} -> {:?} after {} ms",
            self.trace_id,
            self.subject,
            self.state,
            next,
            self.started.elapsed().as_millis()
        );
        self.state = next;
    }
}

/// Sends resolved calls to runners. Holds no per-call state, so one client
/// serves any number of concurrent calls. Never retries.
pub struct DispatchClient {
    bus: Arc<dyn MessageBus>,
    default_timeout: Duration,
}

impl DispatchClient {
    pub fn new(bus: Arc<dyn MessageBus>, default_timeout: Duration) -> Self {
        Self {
            bus,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn invoke(
        &self,
        req: &InvokeRequest,
        timeout: Option<Duration>,
    ) -> FnResult<Envelope> {
        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.default_timeout);

        let msg = req.to_bus_message()?;
        let mut call = Call {
            trace_id: msg.header(HEADER_TRACE_ID).unwrap_or_default().to_string(),
            subject: msg.subject.clone(),
            state: CallState::Building,
            started: Instant::now(),
        };

        call.advance(CallState::Sent);
        let pending = self.bus.request(msg, timeout);
        call.advance(CallState::AwaitingReply);
        let reply = match tokio::time::timeout(timeout, pending).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(FnError::TimedOut(msg))) => {
                call.advance(CallState::TimedOut);
                return Err(FnError::TimedOut(msg));
            }
            Ok(Err(err)) => {
                warn!("call {} on {} failed: {}", call.trace_id, call.subject, err);
                return Err(err);
            }
            Err(_) => {
                call.advance(CallState::TimedOut);
                return Err(FnError::TimedOut(format!(
                    "{} got no reply within {} ms",
                    call.subject,
                    timeout.as_millis()
                )));
            }
        };

        match check_reply(&reply) {
            Ok(()) => {
                let envelope = Envelope::from_reply(&reply)?;
                call.advance(CallState::Succeeded);
                Ok(envelope)
            }
            Err(err) => {
                call.advance(CallState::RemoteError);
                Err(err)
            }
        }
    }

    /// Like `invoke`, but gives up as soon as `cancel` resolves. Work already
    /// handed to the runner is not recalled.
    pub async fn invoke_with_cancel<C>(
        &self,
        req: &InvokeRequest,
        timeout: Option<Duration>,
        cancel: C,
    ) -> FnResult<Envelope>
    where
        C: Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.invoke(req, timeout) => result,
            _ = cancel => {
                debug!("call {}/{} cancelled by caller", req.owner, req.runner);
                Err(FnError::Cancelled(format!(
                    "{}/{}{}",
                    req.owner, req.runner, req.sub_path
                )))
            }
        }
    }
}

/// Anything but code "0" is a well-formed failure from the runner.
fn check_reply(reply: &BusReply) -> FnResult<()> {
    match reply.code() {
        Some(REPLY_CODE_OK) => Ok(()),
        code => Err(FnError::RemoteError {
            code: code.unwrap_or_default().to_string(),
            msg: reply
                .header(HEADER_MSG)
                .unwrap_or("reply carried no code")
                .to_string(),
        }),
    }
}
