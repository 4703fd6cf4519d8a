//! Line scanner for terminal output.
//!
//! The terminal echoes everything: the pasted command line, prompt noise and
//! the command's own output. Only lines that exactly equal a boundary marker
//! move the scanner; the echoed command line contains the markers too but
//! never equals one.

use crate::error::PvmError;

use super::frame::{begin_marker, end_marker, finish_marker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Ignore everything until the begin marker.
    AwaitingBegin,
    /// Command running; its output is discarded.
    InCommand,
    /// Collect footer lines until the end marker.
    AwaitingEnd,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Begin,
    Finish,
    End,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Skip,
    Collect,
}

fn transition(state: ScanState, line: LineKind) -> (ScanState, Action) {
    use Action::*;
    use LineKind::*;
    use ScanState::*;

    match (state, line) {
        (AwaitingBegin, Begin) => (InCommand, Skip),
        (AwaitingBegin, _) => (AwaitingBegin, Skip),
        (InCommand, Finish) => (AwaitingEnd, Skip),
        (InCommand, _) => (InCommand, Skip),
        (AwaitingEnd, End) => (Done, Skip),
        (AwaitingEnd, _) => (AwaitingEnd, Collect),
        (Done, _) => (Done, Skip),
    }
}

pub struct Scanner {
    begin: String,
    finish: String,
    end: String,
    state: ScanState,
    footer: Vec<String>,
}

impl Scanner {
    pub fn new(boundary: &str) -> Self {
        Self {
            begin: begin_marker(boundary),
            finish: finish_marker(boundary),
            end: end_marker(boundary),
            state: ScanState::AwaitingBegin,
            footer: Vec::new(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ScanState::Done
    }

    /// Feed one line (with or without its `\r\n` terminator).
    pub fn feed(&mut self, line: &str) -> ScanState {
        let line = line.trim_end_matches(['\r', '\n']);
        let kind = if line == self.begin {
            LineKind::Begin
        } else if line == self.finish {
            LineKind::Finish
        } else if line == self.end {
            LineKind::End
        } else {
            LineKind::Other
        };
        let (next, action) = transition(self.state, kind);
        if action == Action::Collect {
            self.footer.push(line.to_string());
        }
        self.state = next;
        next
    }

    /// Exit status parsed from the footer.
    pub fn exit_status(&self) -> Result<i32, PvmError> {
        let raw = self
            .footer
            .iter()
            .find_map(|line| line.trim().strip_prefix("exit_status="))
            .ok_or_else(|| PvmError::protocol("no exit status in command footer"))?;
        raw.trim()
            .parse()
            .map_err(|_| PvmError::protocol(format!("invalid exit status '{raw}'")))
    }
}
