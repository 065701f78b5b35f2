// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};

/// Priority for render threads when SOUNDKEYS_THREAD_PRIORITY is unset.
const DEFAULT_RENDER_THREAD_PRIORITY: u8 = 70;

const PRIORITY_VAR: &str = "SOUNDKEYS_THREAD_PRIORITY";
const DISABLE_RT_VAR: &str = "SOUNDKEYS_DISABLE_RT_AUDIO";

/// How far priority setup got on a render thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PriorityOutcome {
    /// Not attempted yet.
    Pending,
    /// Cross-platform priority applied, no real-time scheduling.
    Normal,
    /// Real-time FIFO scheduling enabled.
    Realtime,
    /// Setting the priority failed.
    Failed,
}

/// Reads SOUNDKEYS_THREAD_PRIORITY (0-99) once, before any render thread starts.
pub fn render_thread_priority() -> ThreadPriority {
    parse_priority(std::env::var(PRIORITY_VAR).ok().as_deref())
}

fn parse_priority(value: Option<&str>) -> ThreadPriority {
    value
        .and_then(|v| v.trim().parse::<u8>().ok())
        .filter(|n| *n < 100)
        .and_then(|n| ThreadPriorityValue::try_from(n).ok())
        .or_else(|| ThreadPriorityValue::try_from(DEFAULT_RENDER_THREAD_PRIORITY).ok())
        .map(ThreadPriority::Crossplatform)
        .unwrap_or(ThreadPriority::Max)
}

pub(crate) fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1"
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("on")
}

/// Returns whether to attempt RT (SCHED_FIFO) scheduling for render threads.
/// Default: enabled. Opt out with SOUNDKEYS_DISABLE_RT_AUDIO=1.
pub fn rt_audio_enabled() -> bool {
    !env_flag(DISABLE_RT_VAR)
}

/// Raises the priority of the calling thread once. Does not log, so it is safe
/// to call from an audio callback; the outcome is returned for the caller to report.
pub fn configure_render_thread_priority(
    tp: ThreadPriority,
    rt_audio: bool,
    outcome: &mut PriorityOutcome,
) {
    if *outcome != PriorityOutcome::Pending {
        return;
    }
    *outcome = match set_current_thread_priority(tp) {
        Ok(()) => PriorityOutcome::Normal,
        Err(_) => PriorityOutcome::Failed,
    };

    #[cfg(unix)]
    if rt_audio {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        let tid = thread_native_id();
        let realtime = set_thread_priority_and_policy(
            tid,
            tp,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        )
        .is_ok();
        *outcome = after_realtime_attempt(*outcome, realtime);
    }

    #[cfg(not(unix))]
    let _ = rt_audio;
}

/// A failed FIFO attempt keeps whatever the cross-platform step achieved.
#[cfg_attr(not(unix), allow(dead_code))]
fn after_realtime_attempt(outcome: PriorityOutcome, realtime: bool) -> PriorityOutcome {
    if realtime {
        PriorityOutcome::Realtime
    } else {
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_priority() {
        let default = ThreadPriority::Crossplatform(
            ThreadPriorityValue::try_from(DEFAULT_RENDER_THREAD_PRIORITY).unwrap(),
        );
        assert_eq!(parse_priority(None), default);
        assert_eq!(parse_priority(Some("abc")), default);
        assert_eq!(parse_priority(Some("150")), default);
        assert_eq!(
            parse_priority(Some(" 42 ")),
            ThreadPriority::Crossplatform(ThreadPriorityValue::try_from(42u8).unwrap())
        );
    }

    #[test]
    fn test_truthy_values() {
        for value in ["1", "true", "TRUE", "yes", "On"] {
            assert!(is_truthy(value), "{}", value);
        }
        for value in ["0", "false", "", "nope"] {
            assert!(!is_truthy(value), "{}", value);
        }
    }

    #[test]
    fn test_configure_runs_once() {
        let mut outcome = PriorityOutcome::Failed;
        configure_render_thread_priority(
            ThreadPriority::Crossplatform(ThreadPriorityValue::try_from(10u8).unwrap()),
            false,
            &mut outcome,
        );
        // Already attempted, left alone.
        assert_eq!(outcome, PriorityOutcome::Failed);

        let mut outcome = PriorityOutcome::Pending;
        configure_render_thread_priority(
            ThreadPriority::Crossplatform(ThreadPriorityValue::try_from(10u8).unwrap()),
            false,
            &mut outcome,
        );
        assert_ne!(outcome, PriorityOutcome::Pending);
    }

    #[test]
    fn test_realtime_failure_keeps_earlier_outcome() {
        assert_eq!(
            after_realtime_attempt(PriorityOutcome::Normal, false),
            PriorityOutcome::Normal
        );
        assert_eq!(
            after_realtime_attempt(PriorityOutcome::Failed, false),
            PriorityOutcome::Failed
        );
        assert_eq!(
            after_realtime_attempt(PriorityOutcome::Normal, true),
            PriorityOutcome::Realtime
        );
        assert_eq!(
            after_realtime_attempt(PriorityOutcome::Failed, true),
            PriorityOutcome::Realtime
        );
    }
}
