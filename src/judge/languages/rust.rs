use crate::core::types::{ExecutionProfile, NOBODY};
use crate::harness::HarnessTemplate;
use crate::judge::adapter::LanguageAdapter;
use crate::judge::screen::Denylist;
use crate::safety::workspace::Workspace;

#[derive(Debug, Clone, Default)]
pub struct RustAdapter;

const SOURCE_FILE: &str = "maze_agent.rs";
const BINARY: &str = "maze_agent";

/// Macros that read files or the server environment while compiling
const DENYLIST: Denylist = Denylist {
    identifiers: &["include_str", "include_bytes", "option_env"],
    patterns: &[
        "include!(",
        "include![",
        "include!{",
        "env!(",
        "env![",
        "env!{",
        "::envas",
        "#[path",
        "#[link",
        "#![",
        "externcrate",
    ],
};

const PREFIX: &str = r##"// Maze agent. Implement `fn next_move(view: &MazeView) -> Move` below.

/// One decision of the agent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Move {
    Up,
    Down,
    Left,
    Right,
    GiveUp,
}

/// Read-only view of the maze handed to `next_move`
#[derive(Clone, Debug)]
pub struct MazeView {
    pub row: usize,
    pub col: usize,
    pub goal_row: usize,
    pub goal_col: usize,
    pub size: usize,
    /// Moves made so far
    pub step: u64,
    pub last_move: Option<Move>,
    cells: Vec<u8>,
}

impl MazeView {
    /// Cell at (row, col): '0' open, '1' wall, '2' start, '3' goal.
    /// Cells off the grid read as walls.
    pub fn cell(&self, row: usize, col: usize) -> char {
        if row < self.size && col < self.size {
            self.cells[row * self.size + col] as char
        } else {
            '1'
        }
    }

    /// Whether `mv` from the current cell lands on a cell that is not a wall
    pub fn is_open(&self, mv: Move) -> bool {
        match __maze_harness::target(self.size, self.row, self.col, mv) {
            Some((row, col)) => self.cell(row, col) != '1',
            None => false,
        }
    }
}

// ---- agent code ----
"##;

const SUFFIX: &str = r##"// ---- end of agent code ----

mod __maze_harness {
    use super::{next_move, MazeView, Move};
    use std::io::{Read, Write};

    const FAULT_EXIT: i32 = 70;
    const ENVELOPE_EXIT: i32 = 2;

    pub(crate) fn target(size: usize, row: usize, col: usize, mv: Move) -> Option<(usize, usize)> {
        let (row, col) = match mv {
            Move::Up => (row.checked_sub(1)?, col),
            Move::Down => (row + 1, col),
            Move::Left => (row, col.checked_sub(1)?),
            Move::Right => (row, col + 1),
            Move::GiveUp => return None,
        };
        if row < size && col < size {
            Some((row, col))
        } else {
            None
        }
    }

    fn escape(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                other => out.push(other),
            }
        }
        out
    }

    fn unescape(text: &str) -> Option<String> {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next()? {
                '\\' => out.push('\\'),
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                _ => return None,
            }
        }
        Some(out)
    }

    fn letter(mv: Move) -> char {
        match mv {
            Move::Up => 'U',
            Move::Down => 'D',
            Move::Left => 'L',
            Move::Right => 'R',
            Move::GiveUp => '-',
        }
    }

    struct Envelope {
        nonce: String,
        limit: u64,
        maze: Vec<u8>,
    }

    fn read_envelope() -> Option<Envelope> {
        let mut input = String::new();
        std::io::stdin().read_to_string(&mut input).ok()?;
        let mut nonce = None;
        let mut limit = None;
        let mut maze = None;
        for line in input.lines() {
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            match key {
                "nonce" => nonce = unescape(value),
                "limit" => limit = value.parse::<u64>().ok(),
                "maze" => maze = unescape(value),
                "end" => break,
                _ => {}
            }
        }
        Some(Envelope {
            nonce: nonce?,
            limit: limit?,
            maze: maze?.into_bytes(),
        })
    }

    fn emit(nonce: &str, status: &str, path: &str, detail: &str) {
        let shown = if path.is_empty() { "-" } else { path };
        let mut out = std::io::stdout().lock();
        let _ = write!(
            out,
            "\n@@MAZE {} {} {} {} {}\n",
            nonce,
            status,
            path.len(),
            shown,
            escape(detail)
        );
        let _ = out.flush();
    }

    fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
        if let Some(text) = payload.downcast_ref::<&str>() {
            text.to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        }
    }

    pub(crate) fn drive() -> i32 {
        let envelope = match read_envelope() {
            Some(envelope) => envelope,
            None => {
                eprintln!("maze harness: unreadable envelope");
                return ENVELOPE_EXIT;
            }
        };
        let limit = envelope.limit;
        let nonce = envelope.nonce;
        let cells = envelope.maze;

        let size = (1..=cells.len()).find(|s| s * s >= cells.len()).unwrap_or(0);
        let start = cells.iter().position(|&c| c == b'2');
        let goal = cells.iter().position(|&c| c == b'3');
        let (start, goal) = match (start, goal) {
            (Some(start), Some(goal)) if size * size == cells.len() => (start, goal),
            _ => {
                eprintln!("maze harness: invalid maze layout");
                return ENVELOPE_EXIT;
            }
        };

        let mut view = MazeView {
            row: start / size,
            col: start % size,
            goal_row: goal / size,
            goal_col: goal % size,
            size,
            step: 0,
            last_move: None,
            cells,
        };
        let mut path = String::new();

        std::panic::set_hook(Box::new(|_| {}));

        loop {
            if view.row == view.goal_row && view.col == view.goal_col {
                emit(&nonce, "solved", &path, "reached the goal");
                return 0;
            }
            if view.step >= limit {
                emit(&nonce, "failed", &path, &format!("step limit of {} reached", limit));
                return 0;
            }

            let decision =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| next_move(&view)));
            let mv = match decision {
                Ok(mv) => mv,
                Err(payload) => {
                    let detail = format!(
                        "next_move panicked at step {}: {}",
                        view.step,
                        panic_message(payload.as_ref())
                    );
                    emit(&nonce, "fault", &path, &detail);
                    return FAULT_EXIT;
                }
            };

            if mv == Move::GiveUp {
                emit(&nonce, "failed", &path, &format!("gave up at step {}", view.step));
                return 0;
            }

            match target(view.size, view.row, view.col, mv) {
                Some((row, col)) if view.cell(row, col) != '1' => {
                    view.row = row;
                    view.col = col;
                    view.step += 1;
                    view.last_move = Some(mv);
                    path.push(letter(mv));
                }
                _ => {
                    let detail = format!("blocked move {:?} at step {}", mv, view.step);
                    emit(&nonce, "failed", &path, &detail);
                    return 0;
                }
            }
        }
    }
}

fn main() {
    std::process::exit(__maze_harness::drive());
}
"##;

fn profile(memory_mb: Option<u64>, process_limit: Option<u32>, cpu_ms: u64, wall_ms: u64) -> ExecutionProfile {
    ExecutionProfile {
        memory_limit: memory_mb.map(|mb| mb * 1024 * 1024),
        process_limit,
        cpu_time_limit_ms: Some(cpu_ms),
        wall_time_limit_ms: Some(wall_ms),
        fd_limit: Some(256),
        isolate_network: true,
        isolate_processes: true,
        ..Default::default()
    }
}

impl LanguageAdapter for RustAdapter {
    fn language(&self) -> &'static str {
        "rust"
    }

    fn source_file_name(&self) -> &'static str {
        SOURCE_FILE
    }

    fn template(&self) -> HarnessTemplate {
        HarnessTemplate {
            prefix: PREFIX,
            suffix: SUFFIX,
        }
    }

    fn screen(&self, user_code: &str) -> Option<String> {
        DENYLIST.find(user_code)
    }

    fn compile_profile(&self) -> ExecutionProfile {
        // rustc reserves far more address space than it touches; no RLIMIT_AS.
        ExecutionProfile {
            file_size_limit: Some(256 * 1024 * 1024),
            preserve_env: ["PATH", "HOME", "RUSTUP_HOME", "RUSTUP_TOOLCHAIN", "CARGO_HOME"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ..profile(None, None, 30_000, 45_000)
        }
    }

    fn run_profile(&self) -> ExecutionProfile {
        ExecutionProfile {
            uid: Some(NOBODY),
            gid: Some(NOBODY),
            stack_limit: Some(64 * 1024 * 1024),
            file_size_limit: Some(1024 * 1024),
            fd_limit: Some(64),
            ..profile(Some(256), Some(64), 5_000, 10_000)
        }
    }

    fn compile_command(&self, workspace: &Workspace) -> Vec<String> {
        vec![
            "rustc".to_string(),
            "--edition".to_string(),
            "2021".to_string(),
            "--crate-name".to_string(),
            BINARY.to_string(),
            "--crate-type".to_string(),
            "bin".to_string(),
            "--color".to_string(),
            "never".to_string(),
            "-A".to_string(),
            "warnings".to_string(),
            "-C".to_string(),
            "debuginfo=0".to_string(),
            "-o".to_string(),
            workspace.path(BINARY).to_string_lossy().to_string(),
            workspace.path(SOURCE_FILE).to_string_lossy().to_string(),
        ]
    }

    fn run_command(&self, workspace: &Workspace) -> Vec<String> {
        vec![workspace.path(BINARY).to_string_lossy().to_string()]
    }

    fn version_command(&self) -> Vec<String> {
        vec!["rustc".to_string(), "--version".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_blocks_compile_time_file_access() {
        let adapter = RustAdapter;
        assert!(adapter.screen(r#"const S: &str = include_str!("/etc/passwd");"#).is_some());
        assert!(adapter.screen(r#"const S: &[u8] = include_bytes ! ("/etc/shadow");"#).is_some());
        assert!(adapter.screen(r#"const H: &str = env!("HOME");"#).is_some());
        assert!(adapter.screen(r#"const H: Option<&str> = option_env!("HOME");"#).is_some());
        assert!(adapter.screen("#[path = \"/etc/x.rs\"] mod x;").is_some());
        assert!(adapter.screen("use std::env as e;").is_some());
        assert!(adapter.screen(r#"fn next_move(v: &MazeView) -> Move { include!("/etc/x") }"#).is_some());
        assert!(adapter.screen(r#"include! ["/etc/x"]"#).is_some());
    }

    #[test]
    fn test_screen_allows_include_as_a_name() {
        let adapter = RustAdapter;
        let code = r#"
            fn next_move(view: &MazeView) -> Move {
                let include = view.step % 2 == 0;
                if include { Move::Right } else { Move::Down }
            }
        "#;
        assert_eq!(adapter.screen(code), None);
    }

    #[test]
    fn test_screen_allows_ordinary_agents() {
        let adapter = RustAdapter;
        let code = r#"
            use std::collections::VecDeque;
            fn next_move(view: &MazeView) -> Move {
                let environment = view.step;
                if environment != 0 && view.is_open(Move::Right) { Move::Right } else { Move::Down }
            }
        "#;
        assert_eq!(adapter.screen(code), None);
    }

    #[test]
    fn test_commands_stay_inside_workspace() {
        let root = std::env::temp_dir().join(format!("mazebox_rust_adapter_{}", uuid::Uuid::new_v4()));
        let workspace = Workspace::create(&root).unwrap();
        let adapter = RustAdapter;
        let compile = adapter.compile_command(&workspace);
        assert!(compile.last().unwrap().starts_with(workspace.dir().to_str().unwrap()));
        let run = adapter.run_command(&workspace);
        assert_eq!(run, vec![workspace.path(BINARY).to_string_lossy().to_string()]);
        drop(workspace);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_run_envelope_has_hard_ceilings() {
        let profile = RustAdapter.run_profile();
        assert!(profile.memory_limit.is_some());
        assert!(profile.cpu_time_limit_ms.is_some());
        assert!(profile.process_limit.is_some());
        assert!(profile.isolate_network);
        assert!(profile.isolate_processes);
        assert!(profile.environment.is_empty());
        assert!(profile.preserve_env.is_empty());
    }

    #[test]
    fn test_template_declares_contract() {
        let template = RustAdapter.template();
        assert!(template.prefix.contains("pub enum Move"));
        assert!(template.prefix.contains("pub struct MazeView"));
        assert!(template.suffix.contains("use super::{next_move, MazeView, Move};"));
        assert!(template.suffix.contains("@@MAZE"));
    }
}
