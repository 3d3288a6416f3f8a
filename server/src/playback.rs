use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::protocol::{Command, Envelope};

/// Server clock, unix seconds. Matches the client-reported timestamp unit.
pub fn system_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Error)]
#[error("expected {expected}, got {got}")]
struct CoerceError {
    expected: &'static str,
    got: Value,
}

fn as_bool(value: &Value) -> Result<bool, CoerceError> {
    value.as_bool().ok_or_else(|| CoerceError {
        expected: "bool",
        got: value.clone(),
    })
}

/// Integer fields also accept a float tick or a numeric string.
fn as_int(value: &Value) -> Result<i64, CoerceError> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    if let Some(f) = value.as_f64() {
        return Ok(f as i64);
    }
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CoerceError {
            expected: "int",
            got: value.clone(),
        })
}

fn as_float(value: &Value) -> Result<f64, CoerceError> {
    if let Some(f) = value.as_f64() {
        return Ok(f);
    }
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CoerceError {
            expected: "float",
            got: value.clone(),
        })
}

/// Stamp the field, write the value, suppress rebroadcast when unchanged.
fn apply_deduped<T: PartialEq>(
    slot: &mut Option<T>,
    stamp: &mut Option<f64>,
    value: T,
    ts: Option<f64>,
) -> bool {
    *stamp = ts;
    if slot.as_ref() == Some(&value) {
        return false;
    }
    *slot = Some(value);
    true
}

/// Stamp and write; equal values still rebroadcast.
fn apply_always<T: PartialEq>(
    slot: &mut Option<T>,
    stamp: &mut Option<f64>,
    value: T,
    ts: Option<f64>,
) -> bool {
    *stamp = ts;
    if slot.as_ref() != Some(&value) {
        *slot = Some(value);
    }
    true
}

/// Current playback facts for a room, each field carrying the client-reported
/// timestamp of its last update. Fields start unset until the master reports
/// them.
#[derive(Debug, Default)]
pub struct PlaybackState {
    paused: Option<bool>,
    position: Option<f64>,
    volume: Option<i64>,
    ao_mute: Option<bool>,
    mute: Option<bool>,
    speed: Option<i64>,
    sub_delay: Option<i64>,
    audio_delay: Option<i64>,

    paused_ts: Option<f64>,
    position_ts: Option<f64>,
    volume_ts: Option<f64>,
    ao_mute_ts: Option<f64>,
    mute_ts: Option<f64>,
    speed_ts: Option<f64>,
    sub_delay_ts: Option<f64>,
    audio_delay_ts: Option<f64>,
}

impl PlaybackState {
    /// Apply one master message. Returns true when the update should be
    /// rebroadcast to members, false when it is deduplicated or rejected.
    ///
    /// The dedup rule is asymmetric on purpose: pause and position ticks
    /// always propagate so idle players keep ticking in sync, while discrete
    /// settings (volume, mutes, speed, delays) only go out when they change.
    pub fn update(&mut self, msg: &Envelope) -> bool {
        let Some(name) = msg.name() else {
            tracing::warn!("invalid message, no field name: {:?}", msg);
            return false;
        };
        let ts = msg.timestamp();
        let value = msg.value().unwrap_or(&Value::Null);

        let result = match (msg.command(), name) {
            (Some(Command::State), "pause" | "paused-for-cache") => {
                as_bool(value).map(|v| apply_always(&mut self.paused, &mut self.paused_ts, v, ts))
            }
            (Some(Command::State), "pos") => as_float(value)
                .map(|v| apply_always(&mut self.position, &mut self.position_ts, v, ts)),
            (Some(Command::Action), "seek") => as_float(value)
                .map(|v| apply_always(&mut self.position, &mut self.position_ts, v, ts)),
            (Some(Command::State), "volume") => {
                as_int(value).map(|v| apply_deduped(&mut self.volume, &mut self.volume_ts, v, ts))
            }
            (Some(Command::State), "mute") => {
                as_bool(value).map(|v| apply_deduped(&mut self.mute, &mut self.mute_ts, v, ts))
            }
            (Some(Command::State), "ao-mute") => as_bool(value)
                .map(|v| apply_deduped(&mut self.ao_mute, &mut self.ao_mute_ts, v, ts)),
            (Some(Command::State), "speed") => {
                as_int(value).map(|v| apply_deduped(&mut self.speed, &mut self.speed_ts, v, ts))
            }
            (Some(Command::State), "sub-delay") => as_int(value)
                .map(|v| apply_deduped(&mut self.sub_delay, &mut self.sub_delay_ts, v, ts)),
            (Some(Command::State), "audio-delay") => as_int(value)
                .map(|v| apply_deduped(&mut self.audio_delay, &mut self.audio_delay_ts, v, ts)),
            // Unrecognized pairs pass through untouched (stop, enabled, ...)
            _ => Ok(true),
        };

        match result {
            Ok(broadcast) => broadcast,
            Err(e) => {
                tracing::warn!("invalid message for {name}: {e}");
                false
            }
        }
    }

    pub fn to_json(&self) -> Value {
        let now = system_time();
        json!({
            "pause": field_entry(json!(self.paused), self.paused_ts, now),
            "pos": field_entry(json!(self.position), self.position_ts, now),
            "volume": field_entry(json!(self.volume), self.volume_ts, now),
            "ao_mute": field_entry(json!(self.ao_mute), self.ao_mute_ts, now),
            "mute": field_entry(json!(self.mute), self.mute_ts, now),
            "speed": field_entry(json!(self.speed), self.speed_ts, now),
            "sub_delay": field_entry(json!(self.sub_delay), self.sub_delay_ts, now),
            "audio_delay": field_entry(json!(self.audio_delay), self.audio_delay_ts, now),
        })
    }
}

fn field_entry(value: Value, ts: Option<f64>, now: f64) -> Value {
    json!({
        "value": value,
        "timestamp_server": now,
        "timestamp": ts,
        "req": true,
    })
}

/// Static metadata of the currently loaded media. Replaced wholesale on each
/// `desc` message from the master.
#[derive(Debug, Default)]
pub struct MediaDescription {
    filename: Option<String>,
    filesize: Option<i64>,
    duration: Option<i64>,
    start_pos: Option<f64>,
}

impl MediaDescription {
    pub fn update(&mut self, msg: &Envelope) {
        let extra = msg.extra();
        self.filename = extra.as_ref().and_then(Envelope::filename);
        self.filesize = extra.as_ref().and_then(Envelope::filesize);
        self.duration = extra.as_ref().and_then(Envelope::duration);
        self.start_pos = extra.as_ref().and_then(Envelope::pos);
    }

    pub fn to_json(&self) -> Value {
        let now = system_time();
        json!({
            "filename": desc_entry(json!(&self.filename), now),
            "filesize": desc_entry(json!(self.filesize), now),
            "duration": desc_entry(json!(self.duration), now),
            "pos": desc_entry(json!(self.start_pos), now),
        })
    }
}

fn desc_entry(value: Value, now: f64) -> Value {
    json!({"value": value, "timestamp_server": now, "req": true})
}
