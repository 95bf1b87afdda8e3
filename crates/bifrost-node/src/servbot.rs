//! The servbot joke service, hosted on the loopback broker.

use bifrost_fabric::LoopbackBroker;
use bifrost_types::{codes, ApiError, FabricFrame};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

pub const JOKE_COMMAND: &str = "Joke";

const JOKES: &[&str] = &[
    "I told my computer I needed a break, and it said no problem, it would go to sleep.",
    "There are 10 kinds of people: those who understand binary and those who don't.",
    "A SQL query walks into a bar, walks up to two tables and asks: can I join you?",
    "Why do programmers prefer dark mode? Because light attracts bugs.",
    "I would tell you a UDP joke, but you might not get it.",
];

/// Servbot's answer to a `Joke` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Joke {
    pub text: String,
}

/// Register servbot on `channel` of `broker`.
pub fn install(broker: &LoopbackBroker, channel: &str) {
    broker.register_service(channel, answer);
}

/// Answer one request frame. The frame payload is an `ApiRequest`.
pub fn answer(frame: &FabricFrame) -> Result<Value, ApiError> {
    let command = frame
        .payload
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::new(codes::INVALID_REQUEST, "request has no command"))?;

    match command {
        JOKE_COMMAND => {
            let text = JOKES
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or("I forgot the punchline.");
            debug!(channel = %frame.channel, "Servbot telling a joke");
            Ok(json!(Joke { text: text.to_string() }))
        }
        other => Err(ApiError::new(
            codes::NO_HANDLER,
            format!("servbot does not understand '{}'", other),
        )),
    }
}
