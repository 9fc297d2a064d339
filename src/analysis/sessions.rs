// =============================================================================
// Main-Program Session Segmentation
// =============================================================================
//
// A session is a contiguous stretch of one main program's activity,
// terminated by an interruption from another standard program, by a gap
// longer than the operator's threshold, or by the end of the queried range.
// Within a session, time not spent actually cutting (idle, other statuses,
// non-standard programs) accumulates as loss.
//
// The raw status log is cut into pieces (one per consecutive log pair, plus
// a synthetic terminal piece carrying the last observed state to the window
// end) and fed through a small state machine per target main name.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::config::StatusVocabulary;
use crate::types::{format_hhmmss, StatusLogEntry};

/// Gap length (seconds) above which a session is closed instead of
/// absorbing the gap as loss. Operator-adjustable via configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapThreshold(pub f64);

impl Default for GapThreshold {
    fn default() -> Self {
        Self(300.0)
    }
}

/// One reconstructed main-program session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub program_main_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub process_secs: f64,
    pub loss_secs: f64,
    /// `(status text, seconds)` for every loss stretch inside the session;
    /// feeds the loss-breakdown view.
    pub loss_segments: Vec<(String, f64)>,
    pub notes: String,
    /// Pieces produced in this session; supplied by the operator, passed
    /// through to the archive.
    pub quantity: i32,
    /// Operator note attached to the quantity entry.
    pub notes_qty: String,
}

impl Session {
    /// Actual cutting time: the session envelope minus loss.
    pub fn cycle_time_secs(&self) -> f64 {
        self.process_secs - self.loss_secs
    }

    pub fn process_per_piece_secs(&self) -> f64 {
        per_piece(self.process_secs, self.quantity)
    }

    pub fn loss_per_piece_secs(&self) -> f64 {
        per_piece(self.loss_secs, self.quantity)
    }

    pub fn cycle_time_per_piece_secs(&self) -> f64 {
        per_piece(self.cycle_time_secs(), self.quantity)
    }
}

fn per_piece(total: f64, quantity: i32) -> f64 {
    if quantity > 0 {
        total / f64::from(quantity)
    } else {
        0.0
    }
}

// =============================================================================
// Name helpers
// =============================================================================

/// The main-program name: everything before the first `-`, trimmed. A name
/// without a dash is its own main name.
pub fn main_name(program: &str) -> String {
    program
        .split('-')
        .next()
        .unwrap_or(program)
        .trim()
        .to_string()
}

/// Standard programs have a main name beginning with `N` (case-insensitive).
/// Anything else (macros, MDI fragments, absent programs) is loss context,
/// never a session owner.
pub fn is_standard_program(program: &str) -> bool {
    main_name(program)
        .chars()
        .next()
        .is_some_and(|c| c.eq_ignore_ascii_case(&'n'))
}

// =============================================================================
// Piece classification
// =============================================================================

struct Piece {
    start: DateTime<Utc>,
    duration_secs: f64,
    status_text: String,
    program: String,
    /// Strict Running-vocabulary membership; anything else (idle, other,
    /// vendor edit/jog modes, unknown statuses) is non-cutting time.
    running: bool,
}

/// Cut the logs into pieces: one per consecutive pair, plus the synthetic
/// terminal piece extending the last log to `window_end`.
fn build_pieces(
    vocab: &StatusVocabulary,
    logs: &[StatusLogEntry],
    window_end: DateTime<Utc>,
) -> Vec<Piece> {
    let mut sorted: Vec<&StatusLogEntry> = logs.iter().collect();
    sorted.sort_by_key(|l| l.timestamp);
    sorted.dedup_by_key(|l| l.timestamp);

    let mut pieces = Vec::with_capacity(sorted.len());
    for (i, log) in sorted.iter().enumerate() {
        let piece_end = match sorted.get(i + 1) {
            Some(next) => next.timestamp,
            None => window_end,
        };
        let duration = (piece_end - log.timestamp).num_milliseconds() as f64 / 1000.0;
        if duration <= 0.0 {
            continue;
        }
        pieces.push(Piece {
            start: log.timestamp,
            duration_secs: duration,
            status_text: log.status_text.clone(),
            program: log.current_program.clone().unwrap_or_default(),
            running: vocab.is_running(&log.status_text),
        });
    }
    pieces
}

// =============================================================================
// Segmentation
// =============================================================================

fn timestamp_note(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Segment one main program's window into sessions.
///
/// The captured main name owns the session for its whole span: pieces are
/// matched against `target_main`, so program-name churn inside the Running
/// set never re-labels an open session.
pub fn segment(
    vocab: &StatusVocabulary,
    target_main: &str,
    logs: &[StatusLogEntry],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    gap_threshold: GapThreshold,
) -> Vec<Session> {
    let window_secs = (window_end - window_start).num_milliseconds() as f64 / 1000.0;

    if logs.is_empty() {
        if window_secs <= 0.0 {
            return Vec::new();
        }
        return vec![all_loss_session(
            target_main,
            window_start,
            window_end,
            window_secs,
            "No detailed status logs in this window",
        )];
    }

    let pieces = build_pieces(vocab, logs, window_end);

    let mut sessions: Vec<Session> = Vec::new();
    let mut open: Option<Session> = None;
    let mut note_parts: Vec<String> = Vec::new();

    for piece in &pieces {
        let piece_main = main_name(&piece.program);
        let standard = is_standard_program(&piece.program);

        let this_main_running = piece.running && standard && piece_main == target_main;
        let other_main_running = piece.running && standard && piece_main != target_main;

        if this_main_running {
            if open.is_none() {
                note_parts = vec![if sessions.is_empty() {
                    format!("Session start (at {})", timestamp_note(piece.start))
                } else {
                    format!("Resumed (at {})", timestamp_note(piece.start))
                }];
                open = Some(Session {
                    program_main_name: target_main.to_string(),
                    start: piece.start,
                    end: piece.start,
                    process_secs: 0.0,
                    loss_secs: 0.0,
                    loss_segments: Vec::new(),
                    notes: String::new(),
                    quantity: 1,
                    notes_qty: String::new(),
                });
            }
            let session = open.as_mut().expect("session is open");

            session.process_secs += piece.duration_secs;
            if !piece.running || !standard {
                session.loss_secs += piece.duration_secs;
                session
                    .loss_segments
                    .push((piece.status_text.clone(), piece.duration_secs));
            }
        } else if other_main_running {
            if let Some(mut session) = open.take() {
                session.end = piece.start;
                note_parts.push(format!(
                    "Interrupted by '{}' (at {})",
                    piece.program.trim(),
                    timestamp_note(piece.start)
                ));
                session.notes = note_parts.join("; ");
                sessions.push(session);
                note_parts = Vec::new();
            }
            // Another main's activity never opens a session for this one.
        } else if open.is_some() {
            // Not running under this main: idle, other, an unknown status,
            // a vendor edit/jog mode, or a non-standard program. A short
            // gap is absorbed as loss; a long one ends the session.
            if piece.duration_secs > gap_threshold.0 {
                let mut session = open.take().expect("session is open");
                session.end = piece.start;
                note_parts.push(format!(
                    "Long gap ({}, at {})",
                    format_hhmmss(piece.duration_secs),
                    timestamp_note(piece.start)
                ));
                session.notes = note_parts.join("; ");
                sessions.push(session);
                note_parts = Vec::new();
            } else {
                let session = open.as_mut().expect("session is open");
                session.process_secs += piece.duration_secs;
                session.loss_secs += piece.duration_secs;
                session
                    .loss_segments
                    .push((piece.status_text.clone(), piece.duration_secs));
            }
        }
    }

    if let Some(mut session) = open.take() {
        session.end = window_end;
        note_parts.push(format!("Completed at range end ({})", timestamp_note(window_end)));
        session.notes = note_parts.join("; ");
        sessions.push(session);
    }

    if sessions.is_empty() && window_secs > 0.0 {
        sessions.push(all_loss_session(
            target_main,
            window_start,
            window_end,
            window_secs,
            "No running activity for this main program in the window",
        ));
    }

    sessions
}

fn all_loss_session(
    target_main: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window_secs: f64,
    note: &str,
) -> Session {
    Session {
        program_main_name: target_main.to_string(),
        start,
        end,
        process_secs: 0.0,
        loss_secs: window_secs,
        loss_segments: Vec::new(),
        notes: note.to_string(),
        quantity: 1,
        notes_qty: String::new(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn vocab() -> StatusVocabulary {
        StatusVocabulary::default()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 14, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn log(secs: i64, status: &str, program: Option<&str>) -> StatusLogEntry {
        StatusLogEntry {
            timestamp: at(secs),
            status_text: status.into(),
            spindle_speed: None,
            feed_rate: None,
            current_program: program.map(String::from),
        }
    }

    #[test]
    fn main_name_extraction() {
        assert_eq!(main_name("N1234-5B77"), "N1234");
        assert_eq!(main_name(" N7 "), "N7");
        assert_eq!(main_name("MDI.PRG"), "MDI.PRG");
    }

    #[test]
    fn standard_program_detection() {
        assert!(is_standard_program("N1-1"));
        assert!(is_standard_program("n42"));
        assert!(!is_standard_program("MDI.PRG"));
        assert!(!is_standard_program(""));
    }

    #[test]
    fn long_gap_splits_sessions() {
        // N1 running 60s, idle 120s, N1 running 60s, idle 400s, N1 running
        // 30s, with a 300s gap threshold: two sessions.
        let logs = vec![
            log(0, "Running", Some("N1-1")),
            log(60, "Idle", Some("N1-1")),
            log(180, "Running", Some("N1-1")),
            log(240, "Idle", Some("N1-1")),
            log(640, "Running", Some("N1-1")),
        ];
        let sessions = segment(&vocab(), "N1", &logs, at(0), at(670), GapThreshold(300.0));

        assert_eq!(sessions.len(), 2);

        let a = &sessions[0];
        assert_eq!(a.start, at(0));
        assert_eq!(a.end, at(240));
        assert!((a.process_secs - 240.0).abs() < 1e-9);
        assert!((a.loss_secs - 120.0).abs() < 1e-9);
        assert!(a.notes.contains("Long gap"));

        let b = &sessions[1];
        assert_eq!(b.start, at(640));
        assert_eq!(b.end, at(670));
        assert!((b.process_secs - 30.0).abs() < 1e-9);
        assert!((b.loss_secs - 0.0).abs() < 1e-9);
        assert!(b.notes.contains("Resumed"));
        assert!(b.notes.contains("Completed at range end"));
    }

    #[test]
    fn interruption_by_other_standard_program() {
        // N1 60s, N2 30s, N1 60s: two N1 sessions with no loss; the first
        // notes the interrupting program.
        let logs = vec![
            log(0, "Running", Some("N1-1")),
            log(60, "Running", Some("N2-1")),
            log(90, "Running", Some("N1-2")),
        ];
        let sessions = segment(&vocab(), "N1", &logs, at(0), at(150), GapThreshold(300.0));

        assert_eq!(sessions.len(), 2);
        assert!((sessions[0].process_secs - 60.0).abs() < 1e-9);
        assert_eq!(sessions[0].loss_secs, 0.0);
        assert!(sessions[0].notes.contains("Interrupted by 'N2-1'"));
        assert_eq!(sessions[0].end, at(60));

        assert!((sessions[1].process_secs - 60.0).abs() < 1e-9);
        assert_eq!(sessions[1].loss_secs, 0.0);
        assert_eq!(sessions[1].start, at(90));
        assert_eq!(sessions[1].end, at(150));
    }

    #[test]
    fn short_gap_accumulates_as_loss() {
        let logs = vec![
            log(0, "Running", Some("N5-1")),
            log(100, "Idle", Some("N5-1")),
            log(150, "Running", Some("N5-1")),
        ];
        let sessions = segment(&vocab(), "N5", &logs, at(0), at(250), GapThreshold(300.0));

        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert!((s.process_secs - 250.0).abs() < 1e-9);
        assert!((s.loss_secs - 50.0).abs() < 1e-9);
        assert_eq!(s.loss_segments, vec![("Idle".to_string(), 50.0)]);
        assert_eq!(s.cycle_time_secs(), 200.0);
    }

    #[test]
    fn non_standard_program_is_gap_context() {
        // An MDI macro between two N1 stretches is loss, not an
        // interruption.
        let logs = vec![
            log(0, "Running", Some("N1-1")),
            log(60, "Running", Some("MDI.PRG")),
            log(120, "Running", Some("N1-1")),
        ];
        let sessions = segment(&vocab(), "N1", &logs, at(0), at(180), GapThreshold(300.0));

        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert!((s.process_secs - 180.0).abs() < 1e-9);
        assert!((s.loss_secs - 60.0).abs() < 1e-9);
    }

    #[test]
    fn vendor_mode_with_stale_program_is_loss_not_process() {
        // A Makino sitting in Edit mode still reports the last program
        // name; that time is a gap inside the session, never cutting.
        let logs = vec![
            log(0, "Running", Some("N1-1")),
            log(60, "Edit", Some("N1-1")),
            log(120, "Running", Some("N1-1")),
        ];
        let sessions = segment(&vocab(), "N1", &logs, at(0), at(180), GapThreshold(300.0));

        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert!((s.process_secs - 180.0).abs() < 1e-9);
        assert!((s.loss_secs - 60.0).abs() < 1e-9);
        assert_eq!(s.loss_segments, vec![("Edit".to_string(), 60.0)]);
        assert!((s.cycle_time_secs() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_status_never_counts_as_running() {
        // Statuses outside every vocabulary are non-cutting: they neither
        // open a session nor extend one as process-only time.
        let logs = vec![log(0, "Vendor Special Mode", Some("N2-1"))];
        let sessions = segment(&vocab(), "N2", &logs, at(0), at(100), GapThreshold(300.0));

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].process_secs, 0.0);
        assert!((sessions[0].loss_secs - 100.0).abs() < 1e-9);
        assert!(sessions[0].notes.contains("No running activity"));
    }

    #[test]
    fn window_with_no_running_activity_is_all_loss() {
        let logs = vec![log(0, "Idle", Some("N9-1")), log(100, "Idle", None)];
        let sessions = segment(&vocab(), "N9", &logs, at(0), at(200), GapThreshold(300.0));

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].process_secs, 0.0);
        assert!((sessions[0].loss_secs - 200.0).abs() < 1e-9);
        assert!(sessions[0].notes.contains("No running activity"));
    }

    #[test]
    fn per_piece_metrics_divide_by_quantity() {
        let logs = vec![log(0, "Running", Some("N3-1"))];
        let mut sessions = segment(&vocab(), "N3", &logs, at(0), at(100), GapThreshold(300.0));
        let s = &mut sessions[0];
        s.quantity = 4;
        assert!((s.process_per_piece_secs() - 25.0).abs() < 1e-9);
        assert_eq!(s.loss_per_piece_secs(), 0.0);
        assert!((s.cycle_time_per_piece_secs() - 25.0).abs() < 1e-9);
    }
}
