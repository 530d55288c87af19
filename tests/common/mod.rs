#![allow(dead_code)]

use async_trait::async_trait;
use backstop::{ConnectionErrorKind, Transport, TransportError};
use http::{Request, Response, StatusCode};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// One scripted transport reaction.
#[derive(Debug, Clone)]
pub enum Step {
    Respond { status: u16, headers: Vec<(&'static str, String)> },
    Fail(ConnectionErrorKind),
    /// Respond with `status` after `delay`.
    Slow { delay: Duration, status: u16 },
    /// Never complete.
    Hang,
}

fn respond(status: u16, headers: Vec<(&'static str, String)>) -> Response<()> {
    let mut response = Response::new(());
    *response.status_mut() = StatusCode::from_u16(status).unwrap();
    for (name, value) in headers {
        response.headers_mut().insert(name, value.parse().unwrap());
    }
    response
}

impl Step {
    pub fn status(status: u16) -> Self {
        Step::Respond { status, headers: Vec::new() }
    }

    pub fn with_headers(status: u16, headers: &[(&'static str, &str)]) -> Self {
        Step::Respond {
            status,
            headers: headers.iter().map(|(k, v)| (*k, v.to_string())).collect(),
        }
    }

    async fn run(self) -> Result<Response<()>, TransportError> {
        match self {
            Step::Respond { status, headers } => Ok(respond(status, headers)),
            Step::Fail(kind) => Err(TransportError::new(kind, "scripted failure")),
            Step::Slow { delay, status } => {
                tokio::time::sleep(delay).await;
                Ok(respond(status, Vec::new()))
            }
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Transport that plays back a script, then repeats a fallback step.
#[derive(Debug)]
pub struct Scripted {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<(Instant, String)>>,
}

impl Scripted {
    pub fn always(step: Step) -> Self {
        Self::new(Vec::new(), step)
    }

    pub fn new(script: Vec<Step>, fallback: Step) -> Self {
        Self { script: Mutex::new(script.into()), fallback, calls: Mutex::new(Vec::new()) }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn paths(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(_, path)| path.clone()).collect()
    }

    /// Gaps between consecutive calls.
    pub fn gaps(&self) -> Vec<Duration> {
        self.call_times().windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub async fn call(&self) -> Result<Response<()>, TransportError> {
        self.send(Request::new(())).await
    }
}

#[async_trait]
impl Transport<()> for Scripted {
    type Body = ();

    async fn send(&self, request: Request<()>) -> Result<Response<()>, TransportError> {
        self.calls.lock().unwrap().push((Instant::now(), request.uri().path().to_string()));
        let step = self.script.lock().unwrap().pop_front().unwrap_or_else(|| self.fallback.clone());
        step.run().await
    }
}

pub fn assert_close(actual: Duration, expected: Duration) {
    let tolerance = Duration::from_millis(5);
    let diff = if actual > expected { actual - expected } else { expected - actual };
    assert!(diff <= tolerance, "expected ~{expected:?}, got {actual:?}");
}
