//! Scripted fakes for the command and clock ports.
//!
//! `FakeCommander` replays a fixed sequence of responses to command
//! invocations and `FakeClock` replays a fixed sequence of instants, so a
//! test case can pin down every external interaction of a component.

use crate::clock::Clock;
use crate::command::Commander;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

/// One scripted response: the stdout to return, or an error carrying it.
#[derive(Debug, Clone)]
pub struct FakeResponse {
    pub stdout: String,
    pub fail: bool,
}

impl FakeResponse {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            fail: false,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            stdout: message.into(),
            fail: true,
        }
    }
}

/// Commander that replays a scripted sequence of responses.
///
/// With `repeat_last` set, the final response is replayed forever once the
/// script runs out; otherwise running out panics, which surfaces a test that
/// issues more commands than it scripted.
pub struct FakeCommander {
    responses: Mutex<VecDeque<FakeResponse>>,
    repeat_last: bool,
    invoked: Mutex<Vec<String>>,
}

impl FakeCommander {
    pub fn new(responses: Vec<FakeResponse>, repeat_last: bool) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            repeat_last,
            invoked: Mutex::new(Vec::new()),
        }
    }

    /// Build from `(stdout, is_error)` pairs.
    pub fn scripted(pairs: &[(&str, bool)], repeat_last: bool) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|(out, fail)| FakeResponse {
                    stdout: (*out).to_string(),
                    fail: *fail,
                })
                .collect(),
            repeat_last,
        )
    }

    /// Every command line issued so far, in order.
    pub fn invocations(&self) -> Vec<String> {
        self.invoked.lock().unwrap().clone()
    }

    pub fn times_called(&self) -> usize {
        self.invoked.lock().unwrap().len()
    }

    fn next(&self, program: &str, args: &[&str]) -> Result<String> {
        self.invoked
            .lock()
            .unwrap()
            .push(format!("{} {}", program, args.join(" ")));

        let mut responses = self.responses.lock().unwrap();
        let response = if self.repeat_last && responses.len() == 1 {
            responses.front().cloned()
        } else {
            responses.pop_front()
        }
        .expect("FakeCommander: script exhausted");

        if response.fail {
            return Err(CoreError::command_failed(
                format!("{} {}", program, args.join(" ")),
                1,
                response.stdout,
            ));
        }
        Ok(response.stdout)
    }
}

#[async_trait]
impl Commander for FakeCommander {
    async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        self.next(program, args).map(|_| ())
    }

    async fn output(&self, program: &str, args: &[&str]) -> Result<String> {
        self.next(program, args)
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> Result<()> {
        self.next(program, args).map(|_| ())
    }
}

/// Clock that replays a scripted sequence of instants.
pub struct FakeClock {
    times: Mutex<VecDeque<DateTime<Utc>>>,
    repeat_last: bool,
    calls: Mutex<usize>,
}

impl FakeClock {
    pub fn new(times: Vec<DateTime<Utc>>, repeat_last: bool) -> Self {
        Self {
            times: Mutex::new(times.into()),
            repeat_last,
            calls: Mutex::new(0),
        }
    }

    /// Build from epoch seconds.
    pub fn at_secs(secs: &[i64], repeat_last: bool) -> Self {
        Self::new(
            secs.iter()
                .map(|s| DateTime::from_timestamp(*s, 0).expect("valid timestamp"))
                .collect(),
            repeat_last,
        )
    }

    pub fn times_called(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.calls.lock().unwrap() += 1;

        let mut times = self.times.lock().unwrap();
        if self.repeat_last && times.len() == 1 {
            return *times.front().expect("FakeClock: script exhausted");
        }
        times.pop_front().expect("FakeClock: script exhausted")
    }
}
