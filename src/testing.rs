// ABOUTME: In-memory fakes for the HTTP transport, command runner and session provider
// ABOUTME: Compiled for tests only; every fake records what it was asked to do

use futures::future::BoxFuture;
use reqwest::Method;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{ApiSettings, TlsPolicy};
use crate::credentials::{CredentialResolver, CredentialSet};
use crate::error::MigratorError;
use crate::remote::client::ApiClient;
use crate::remote::transport::{ApiRequest, RawResponse, Transport, TransportError};
use crate::transfer::session::{RemoteSession, SessionEndpoint, SessionProvider, SessionRequest};
use crate::transfer::{CommandOutput, CommandRunner};

pub const BASE_URL: &str = "https://ml.example.com";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, String),
    Fail(TransportError),
}

impl Reply {
    pub fn json(value: serde_json::Value) -> Self {
        Reply::Status(200, value.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }
}

#[derive(Default)]
struct RouteState {
    queued: VecDeque<Reply>,
    last: Option<Reply>,
    delay: Option<Duration>,
}

impl RouteState {
    fn next(&mut self) -> Option<Reply> {
        match self.queued.pop_front() {
            Some(reply) => {
                self.last = Some(reply.clone());
                Some(reply)
            }
            None => self.last.clone(),
        }
    }
}

/// Routes by method and path (query ignored). The last reply of a route
/// repeats; unknown routes answer 404.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<(Method, String), RouteState>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces the replies of a route.
    pub fn sequence(&self, method: Method, path: &str, replies: Vec<Reply>) {
        let mut routes = lock(&self.routes);
        let route = routes.entry((method, path.to_string())).or_default();
        route.queued = replies.into();
        route.last = None;
    }

    pub fn json(&self, method: Method, path: &str, value: serde_json::Value) {
        self.sequence(method, path, vec![Reply::json(value)]);
    }

    pub fn reply(&self, method: Method, path: &str, status: u16, body: &str) {
        self.sequence(method, path, vec![Reply::Status(status, body.to_string())]);
    }

    pub fn delay(&self, method: Method, path: &str, delay: Duration) {
        let mut routes = lock(&self.routes);
        routes.entry((method, path.to_string())).or_default().delay = Some(delay);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    pub fn count(&self, method: &Method, path: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| &r.method == method && r.path == path)
            .count()
    }

    /// Requests to `path` with the given method, in order.
    pub fn bodies(&self, method: &Method, path: &str) -> Vec<serde_json::Value> {
        lock(&self.requests)
            .iter()
            .filter(|r| &r.method == method && r.path == path)
            .filter_map(|r| r.body.clone())
            .collect()
    }
}

fn split_url(url: &str) -> (String, String) {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path_and_query = without_scheme
        .find('/')
        .map(|i| &without_scheme[i..])
        .unwrap_or("/");
    match path_and_query.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (path_and_query.to_string(), String::new()),
    }
}

impl Transport for FakeTransport {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<RawResponse, TransportError>> {
        Box::pin(async move {
            let (path, query) = split_url(&request.url);
            lock(&self.requests).push(RecordedRequest {
                method: request.method.clone(),
                path: path.clone(),
                query,
                headers: request.headers.clone(),
                body: request.body.clone(),
            });

            let (reply, delay) = {
                let mut routes = lock(&self.routes);
                match routes.get_mut(&(request.method.clone(), path)) {
                    Some(route) => (route.next(), route.delay),
                    None => (None, None),
                }
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            match reply {
                Some(Reply::Status(status, body)) => Ok(RawResponse { status, body }),
                Some(Reply::Fail(err)) => Err(err),
                None => Ok(RawResponse {
                    status: 404,
                    body: r#"{"message":"no route"}"#.to_string(),
                }),
            }
        })
    }
}

/// Client against the fake with zero backoff and four attempts.
pub fn client_with(transport: &Arc<FakeTransport>, credentials: CredentialSet) -> ApiClient {
    let resolved = match CredentialResolver::resolve(&credentials) {
        Ok(resolved) => resolved,
        Err(err) => panic!("test credentials must resolve: {err}"),
    };
    let settings = ApiSettings {
        max_attempts: 4,
        initial_backoff_ms: 0,
        max_backoff_ms: 0,
        ..ApiSettings::default()
    };
    ApiClient::new(
        BASE_URL,
        resolved,
        transport.clone(),
        &settings,
        &TlsPolicy::SystemDefault,
    )
}

#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Contents of the `--exclude-from` file at the time of the call.
    pub exclusions: Option<String>,
}

impl RecordedCommand {
    pub fn is_dry_run(&self) -> bool {
        self.args.iter().any(|a| a == "-n")
    }
}

/// Scripted exit codes for transfer calls; the last code repeats. Dry runs
/// always exit 0 with the configured itemized output.
#[derive(Default)]
pub struct FakeRunner {
    exits: Mutex<VecDeque<i32>>,
    last: Mutex<i32>,
    dry_run_stdout: Mutex<String>,
    calls: Mutex<Vec<RecordedCommand>>,
}

impl FakeRunner {
    pub fn exits(codes: &[i32]) -> Arc<Self> {
        let runner = Self::default();
        lock(&runner.exits).extend(codes.iter().copied());
        Arc::new(runner)
    }

    pub fn with_dry_run_output(&self, stdout: &str) {
        *lock(&self.dry_run_stdout) = stdout.to_string();
    }

    pub fn calls(&self) -> Vec<RecordedCommand> {
        lock(&self.calls).clone()
    }

    pub fn transfer_calls(&self) -> Vec<RecordedCommand> {
        self.calls().into_iter().filter(|c| !c.is_dry_run()).collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run<'a>(
        &'a self,
        program: &'a Path,
        args: &'a [String],
    ) -> BoxFuture<'a, std::io::Result<CommandOutput>> {
        Box::pin(async move {
            let exclusions = args
                .iter()
                .find_map(|a| a.strip_prefix("--exclude-from="))
                .and_then(|path| std::fs::read_to_string(path).ok());
            let call = RecordedCommand {
                program: program.to_path_buf(),
                args: args.to_vec(),
                exclusions,
            };
            let dry_run = call.is_dry_run();
            lock(&self.calls).push(call);

            if dry_run {
                return Ok(CommandOutput {
                    status: Some(0),
                    stdout: lock(&self.dry_run_stdout).clone(),
                    stderr: String::new(),
                });
            }

            let code = {
                let mut last = lock(&self.last);
                if let Some(code) = lock(&self.exits).pop_front() {
                    *last = code;
                }
                *last
            };
            Ok(CommandOutput {
                status: Some(code),
                stdout: String::new(),
                stderr: if code == 0 {
                    String::new()
                } else {
                    format!("rsync error: code {}", code)
                },
            })
        })
    }
}

/// Hands out sessions on localhost without spawning anything.
#[derive(Default)]
pub struct FakeSessions {
    failure: Option<String>,
    opened: Mutex<Vec<SessionRequest>>,
}

impl FakeSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            failure: Some(message.to_string()),
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn opened(&self) -> Vec<SessionRequest> {
        lock(&self.opened).clone()
    }
}

impl SessionProvider for FakeSessions {
    fn open<'a>(
        &'a self,
        request: &'a SessionRequest,
    ) -> BoxFuture<'a, Result<RemoteSession, MigratorError>> {
        Box::pin(async move {
            lock(&self.opened).push(request.clone());
            match &self.failure {
                Some(message) => Err(MigratorError::Session(message.clone())),
                None => Ok(RemoteSession::detached(SessionEndpoint {
                    user: "cdsw".to_string(),
                    host: "localhost".to_string(),
                    port: 2222,
                })),
            }
        })
    }
}
