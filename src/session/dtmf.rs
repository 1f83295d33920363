//! DTMF scheduling
//!
//! Tones are queued per session and paced by a single outstanding timer.
//! Each non-comma tone goes out as an in-dialog INFO (`application/dtmf-relay`)
//! and raises a `NewDtmf` event; a comma is a fixed pause that sends nothing.
//! Appending while a burst is in flight extends the queue; termination or a
//! failed send clears it.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use super::SessionCommand;
use crate::errors::{Result, SessionError};

pub(crate) const DEFAULT_DURATION: u64 = 100;
pub(crate) const MIN_DURATION: u64 = 70;
pub(crate) const MAX_DURATION: u64 = 6000;
pub(crate) const DEFAULT_INTER_TONE_GAP: u64 = 500;
pub(crate) const MIN_INTER_TONE_GAP: u64 = 50;
/// A `,` in the tone string pauses this long and emits nothing.
pub(crate) const COMMA_PAUSE: u64 = 2000;

/// One queued tone with its (already clamped) timing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueuedTone {
    pub tone: char,
    pub duration: u64,
    pub gap: u64,
}

/// Validate and normalize a tone string. Uppercases letters; rejects empty
/// input and characters outside `[0-9A-D#*,]`.
pub(crate) fn parse_tones(tones: &str) -> Result<Vec<char>> {
    if tones.is_empty() {
        return Err(SessionError::InvalidTones(tones.to_string()));
    }
    let mut out = Vec::with_capacity(tones.len());
    for c in tones.chars() {
        let c = c.to_ascii_uppercase();
        match c {
            '0'..='9' | 'A'..='D' | '#' | '*' | ',' => out.push(c),
            _ => return Err(SessionError::InvalidTones(tones.to_string())),
        }
    }
    Ok(out)
}

/// Clamp a tone duration into `[MIN_DURATION, MAX_DURATION]`.
pub(crate) fn clamp_duration(duration: Option<u64>) -> Result<u64> {
    let value = match duration {
        None => return Ok(DEFAULT_DURATION),
        Some(0) => return Err(SessionError::InvalidDtmfTiming(0)),
        Some(v) => v,
    };
    if value < MIN_DURATION {
        warn!("DTMF duration {value}ms below minimum, clamping to {MIN_DURATION}ms");
        Ok(MIN_DURATION)
    } else if value > MAX_DURATION {
        warn!("DTMF duration {value}ms above maximum, clamping to {MAX_DURATION}ms");
        Ok(MAX_DURATION)
    } else {
        Ok(value)
    }
}

/// Clamp an inter-tone gap to at least `MIN_INTER_TONE_GAP`.
pub(crate) fn clamp_gap(gap: Option<u64>) -> Result<u64> {
    let value = match gap {
        None => return Ok(DEFAULT_INTER_TONE_GAP),
        Some(0) => return Err(SessionError::InvalidDtmfTiming(0)),
        Some(v) => v,
    };
    if value < MIN_INTER_TONE_GAP {
        warn!("DTMF inter-tone gap {value}ms below minimum, clamping to {MIN_INTER_TONE_GAP}ms");
        Ok(MIN_INTER_TONE_GAP)
    } else {
        Ok(value)
    }
}

/// Build the INFO body for one tone.
pub(crate) fn info_body(tone: char, duration: u64) -> String {
    format!("Signal={tone}\r\nDuration={duration}\r\n")
}

/// Parse an incoming `application/dtmf-relay` body into (tone, duration).
pub(crate) fn parse_info_body(body: &str) -> Option<(char, u64)> {
    let mut tone = None;
    let mut duration = DEFAULT_DURATION;
    for line in body.lines() {
        let Some((key, value)) = line.split_once('=') else { continue };
        match key.trim().to_ascii_lowercase().as_str() {
            "signal" => tone = value.trim().chars().next(),
            "duration" => {
                if let Ok(v) = value.trim().parse() {
                    duration = v;
                }
            }
            _ => {}
        }
    }
    tone.map(|t| (t.to_ascii_uppercase(), duration))
}

/// Per-session tone queue. There is exactly one outstanding timer at a time;
/// `in_flight` is the `tones ≠ null` latch of the scheduling contract.
pub(crate) struct DtmfQueue {
    tx: mpsc::UnboundedSender<SessionCommand>,
    pub queue: VecDeque<QueuedTone>,
    pub in_flight: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl DtmfQueue {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { tx, queue: VecDeque::new(), in_flight: false, generation: 0, timer: None }
    }

    /// Schedule the next tick. Replaces any pending tick.
    pub(crate) fn schedule(&mut self, delay: Duration) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionCommand::DtmfTick { generation });
        }));
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Drop all queued tones and the pending tick.
    pub(crate) fn clear(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        self.generation += 1;
        self.queue.clear();
        self.in_flight = false;
    }
}

impl Drop for DtmfQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }
}
