use func_lib::{
    new_trace_id, normalize_name_path, unix_timestamp_millis, Envelope, FnResult, FunctionId,
    InvokeRequest, RunRecord, RunStatus, RunnerId, HEADER_VERSION,
};
use func_meta::{PathResolver, RunRecorder};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch_client::{CallState, DispatchClient};

/// What the HTTP layer hands over for one inbound request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallRequest {
    pub owner: String,
    pub runner: String,
    pub method: String,
    /// Route below the runner, e.g. `/sum`.
    pub sub_route: String,
    pub raw_query: String,
    pub body: Vec<u8>,
    pub trace_id: Option<String>,
}

struct Target {
    function_id: Option<FunctionId>,
    runner_id: RunnerId,
    runner_name: String,
    version: String,
    sub_path: String,
}

pub struct FunctionGateway {
    resolver: PathResolver,
    client: DispatchClient,
    recorder: Arc<RunRecorder>,
    timeout: Option<Duration>,
}

impl FunctionGateway {
    pub fn new(resolver: PathResolver, client: DispatchClient, recorder: Arc<RunRecorder>) -> Self {
        Self {
            resolver,
            client,
            recorder,
            timeout: None,
        }
    }

    /// Overrides the client's default timeout for calls made here.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn recorder(&self) -> &Arc<RunRecorder> {
        &self.recorder
    }

    pub async fn call(&self, req: CallRequest) -> FnResult<Envelope> {
        self.call_with_cancel(req, std::future::pending::<()>()).await
    }

    /// The runner keeps working on a cancelled call; only the wait stops.
    pub async fn call_with_cancel<C>(&self, req: CallRequest, cancel: C) -> FnResult<Envelope>
    where
        C: Future<Output = ()> + Send,
    {
        let target = self.resolve(&req).await?;
        let invoke = InvokeRequest {
            trace_id: req.trace_id.clone().unwrap_or_else(new_trace_id),
            owner: req.owner.clone(),
            runner: target.runner_name.clone(),
            version: target.version.clone(),
            method: req.method.clone(),
            sub_path: target.sub_path.clone(),
            raw_query: req.raw_query.clone(),
            body: req.body,
        };

        let start_ts = unix_timestamp_millis();
        let result = self
            .client
            .invoke_with_cancel(&invoke, self.timeout, cancel)
            .await
            .map(|mut envelope| {
                envelope.set_meta(HEADER_VERSION, target.version.clone());
                envelope
            });
        let end_ts = unix_timestamp_millis();

        let (status, message, response) = match &result {
            Ok(envelope) => {
                let response = envelope.to_json_bytes().unwrap_or_else(|err| {
                    warn!(
                        "encode response of {} for run record failed: {}",
                        invoke.trace_id, err
                    );
                    Vec::new()
                });
                (RunStatus::Success, String::new(), response)
            }
            Err(err) => (RunStatus::Fail, err.to_string(), Vec::new()),
        };
        info!(
            "call {}/{}{} [{}] {} in {} ms ({:?})",
            invoke.owner,
            invoke.runner,
            invoke.sub_path,
            invoke.trace_id,
            status.as_str(),
            end_ts.saturating_sub(start_ts),
            CallState::of(&result)
        );
        self.recorder.record(RunRecord {
            function_id: target.function_id,
            runner_id: target.runner_id,
            trace_id: invoke.trace_id,
            request: invoke.body,
            response,
            status,
            message,
            start_ts,
            end_ts,
            cost_ms: end_ts.saturating_sub(start_ts),
        });
        result
    }

    /// A tree leaf wins; otherwise the runner serves the route itself.
    async fn resolve(&self, req: &CallRequest) -> FnResult<Target> {
        match self
            .resolver
            .resolve_function(&req.owner, &req.runner, &req.sub_route, &req.method)
            .await
        {
            Ok(resolved) => Ok(Target {
                function_id: Some(resolved.function_id),
                runner_id: resolved.runner_id,
                runner_name: resolved.runner_name,
                version: resolved.version,
                sub_path: resolved.sub_path,
            }),
            Err(err) if err.is_not_found() => {
                let runner = self.resolver.resolve_runner(&req.owner, &req.runner).await?;
                let sub_path = normalize_name_path(&req.sub_route)?;
                debug!(
                    "{}/{}{} has no tree leaf, routing to the runner",
                    req.owner, req.runner, sub_path
                );
                Ok(Target {
                    function_id: None,
                    runner_id: runner.runner_id,
                    runner_name: runner.runner_name,
                    version: runner.version,
                    sub_path,
                })
            }
            Err(err) => Err(err),
        }
    }
}
