/// Process-boundary wire format.
///
/// Parent -> child: the stdin envelope, one `key value` line per field with
/// every value escaped, terminated by `end`.
///
/// Child -> parent: the harness's final stdout line
/// `@@MAZE <nonce> <solved|failed|fault> <moves> <path|-> <escaped detail>`.
use crate::harness::escape::{escape, unescape};
use crate::maze::MazeLayout;
use std::fmt;

pub const MARKER: &str = "@@MAZE";
pub const EMPTY_PATH: &str = "-";

/// Exit code the harness uses after catching a fault in user code
pub const FAULT_EXIT_CODE: i32 = 70;

/// Exit code the harness uses when the envelope is unreadable
pub const ENVELOPE_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub nonce: String,
    pub step_limit: u64,
    pub maze: String,
}

impl Envelope {
    /// Fresh envelope with a per-invocation nonce
    pub fn new(layout: &MazeLayout, step_limit: u64) -> Self {
        Self {
            nonce: uuid::Uuid::new_v4().simple().to_string(),
            step_limit,
            maze: layout.serialize(),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "nonce {}\nlimit {}\nmaze {}\nend\n",
            escape(&self.nonce),
            self.step_limit,
            escape(&self.maze)
        )
    }

    pub fn decode(text: &str) -> Result<Self, MarkerError> {
        let mut nonce = None;
        let mut step_limit = None;
        let mut maze = None;

        for line in text.lines() {
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            match key {
                "nonce" => nonce = Some(unescape(value).map_err(|e| MarkerError::Field("nonce", e.to_string()))?),
                "limit" => {
                    step_limit = Some(
                        value
                            .parse()
                            .map_err(|_| MarkerError::Field("limit", value.to_string()))?,
                    )
                }
                "maze" => maze = Some(unescape(value).map_err(|e| MarkerError::Field("maze", e.to_string()))?),
                "end" => break,
                _ => {}
            }
        }

        Ok(Self {
            nonce: nonce.ok_or(MarkerError::Missing("nonce"))?,
            step_limit: step_limit.ok_or(MarkerError::Missing("limit"))?,
            maze: maze.ok_or(MarkerError::Missing("maze"))?,
        })
    }
}

/// Terminal state the harness reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedStatus {
    Solved,
    Failed,
    Fault,
}

impl ReportedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportedStatus::Solved => "solved",
            ReportedStatus::Failed => "failed",
            ReportedStatus::Fault => "fault",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "solved" => Some(ReportedStatus::Solved),
            "failed" => Some(ReportedStatus::Failed),
            "fault" => Some(ReportedStatus::Fault),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerError {
    Missing(&'static str),
    Field(&'static str, String),
}

impl fmt::Display for MarkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerError::Missing(field) => write!(f, "missing field '{}'", field),
            MarkerError::Field(field, value) => write!(f, "malformed field '{}': {}", field, value),
        }
    }
}

/// Parsed result marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMarker {
    pub nonce: String,
    pub status: ReportedStatus,
    pub moves: usize,
    pub path: String,
    pub detail: String,
}

impl ResultMarker {
    pub fn render(&self) -> String {
        let path = if self.path.is_empty() {
            EMPTY_PATH
        } else {
            self.path.as_str()
        };
        format!(
            "{} {} {} {} {} {}",
            MARKER,
            self.nonce,
            self.status.as_str(),
            self.moves,
            path,
            escape(&self.detail)
        )
    }

    /// `None` when the line is not a marker at all
    pub fn parse_line(line: &str) -> Option<Result<Self, MarkerError>> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let rest = line.strip_prefix(MARKER)?.strip_prefix(' ')?;
        Some(Self::parse_fields(rest))
    }

    fn parse_fields(rest: &str) -> Result<Self, MarkerError> {
        let mut fields = rest.splitn(5, ' ');
        let nonce = fields.next().filter(|s| !s.is_empty()).ok_or(MarkerError::Missing("nonce"))?;
        let status_text = fields.next().ok_or(MarkerError::Missing("status"))?;
        let status = ReportedStatus::parse(status_text)
            .ok_or_else(|| MarkerError::Field("status", status_text.to_string()))?;
        let moves_text = fields.next().ok_or(MarkerError::Missing("moves"))?;
        let moves = moves_text
            .parse()
            .map_err(|_| MarkerError::Field("moves", moves_text.to_string()))?;
        let path = match fields.next().ok_or(MarkerError::Missing("path"))? {
            EMPTY_PATH => String::new(),
            other => other.to_string(),
        };
        let detail = unescape(fields.next().unwrap_or(""))
            .map_err(|e| MarkerError::Field("detail", e.to_string()))?;

        Ok(Self {
            nonce: nonce.to_string(),
            status,
            moves,
            path,
            detail,
        })
    }
}

/// Program output split into the user's own text and the harness verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedOutput {
    /// Last marker carrying the expected nonce
    pub marker: Option<Result<ResultMarker, MarkerError>>,
    /// Everything else the program printed, marker lines removed
    pub program_output: String,
}

/// Scan stdout for the marker bound to `nonce`. Earlier markers and markers
/// carrying any other nonce are treated as ordinary program output.
pub fn scan_output(stdout: &str, nonce: &str) -> ScannedOutput {
    let mut marker = None;
    let mut program_output = String::new();

    for line in stdout.lines() {
        match ResultMarker::parse_line(line) {
            Some(Ok(parsed)) if parsed.nonce == nonce => marker = Some(Ok(parsed)),
            Some(Err(err)) if line_carries_nonce(line, nonce) => marker = Some(Err(err)),
            _ => {
                program_output.push_str(line);
                program_output.push('\n');
            }
        }
    }

    ScannedOutput {
        marker,
        program_output,
    }
}

fn line_carries_nonce(line: &str, nonce: &str) -> bool {
    line.split(' ').nth(1) == Some(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maze::tests::SAMPLE;

    #[test]
    fn test_envelope_is_line_framed() {
        let layout = MazeLayout::parse(SAMPLE).unwrap();
        let envelope = Envelope::new(&layout, 500);
        let text = envelope.encode();
        assert_eq!(text.lines().count(), 4);
        assert!(text.ends_with("end\n"));
        assert_eq!(Envelope::decode(&text).unwrap(), envelope);
    }

    #[test]
    fn test_nonces_are_unique_per_envelope() {
        let layout = MazeLayout::parse(SAMPLE).unwrap();
        assert_ne!(
            Envelope::new(&layout, 1).nonce,
            Envelope::new(&layout, 1).nonce
        );
    }

    #[test]
    fn test_envelope_missing_field() {
        assert_eq!(
            Envelope::decode("nonce abc\nlimit 3\nend\n"),
            Err(MarkerError::Missing("maze"))
        );
    }

    #[test]
    fn test_marker_render_parse() {
        let marker = ResultMarker {
            nonce: "abc123".to_string(),
            status: ReportedStatus::Failed,
            moves: 2,
            path: "RD".to_string(),
            detail: "blocked move\nat step 2 \\ wall".to_string(),
        };
        let line = marker.render();
        assert!(!line.contains('\n'));
        assert_eq!(ResultMarker::parse_line(&line), Some(Ok(marker)));
    }

    #[test]
    fn test_marker_with_empty_path_and_detail() {
        let parsed = ResultMarker::parse_line("@@MAZE n1 fault 0 - ").unwrap().unwrap();
        assert_eq!(parsed.path, "");
        assert_eq!(parsed.detail, "");
        assert_eq!(parsed.status, ReportedStatus::Fault);
    }

    #[test]
    fn test_non_marker_lines() {
        assert!(ResultMarker::parse_line("hello").is_none());
        assert!(ResultMarker::parse_line("@@MAZEX n solved 0 - ").is_none());
        assert!(matches!(
            ResultMarker::parse_line("@@MAZE n1 won 1 R x"),
            Some(Err(MarkerError::Field("status", _)))
        ));
    }

    #[test]
    fn test_scan_ignores_forged_markers() {
        let stdout = "thinking...\n\
                      @@MAZE forged solved 6 RRDDDR fake\n\
                      @@MAZE real failed 1 R early\n\
                      more user text\n\
                      @@MAZE real solved 6 RRDDDR reached the goal\n";
        let scanned = scan_output(stdout, "real");
        let marker = scanned.marker.unwrap().unwrap();
        assert_eq!(marker.status, ReportedStatus::Solved);
        assert_eq!(marker.moves, 6);
        assert!(scanned.program_output.contains("forged"));
        assert!(scanned.program_output.contains("more user text"));
        assert!(!scanned.program_output.contains("reached the goal"));
    }

    #[test]
    fn test_scan_without_marker() {
        let scanned = scan_output("just text\n", "n");
        assert!(scanned.marker.is_none());
        assert_eq!(scanned.program_output, "just text\n");
    }
}
