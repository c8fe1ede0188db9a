use crate::core::types::{ExecutionProfile, NOBODY};
use crate::harness::HarnessTemplate;
use crate::judge::adapter::LanguageAdapter;
use crate::judge::screen::Denylist;
use crate::safety::workspace::Workspace;

#[derive(Debug, Clone, Default)]
pub struct JavaAdapter;

const CLASS_NAME: &str = "MazeHarness";
const SOURCE_FILE: &str = "MazeHarness.java";

/// Unicode escapes are decoded before parsing and could close the harness
/// class early. Annotation processing is switched off on the command line.
const DENYLIST: Denylist = Denylist {
    identifiers: &[],
    patterns: &["\\u"],
};

const PREFIX: &str = r##"import java.io.*;
import java.nio.charset.StandardCharsets;
import java.util.*;

public class MazeHarness {
    public enum Move { UP, DOWN, LEFT, RIGHT, GIVE_UP }

    /** Read-only view of the maze handed to nextMove. */
    public static final class MazeView {
        public final int row;
        public final int col;
        public final int goalRow;
        public final int goalCol;
        public final int size;
        public final long step;
        public final Move lastMove;
        private final String cells;

        MazeView(int row, int col, int goalRow, int goalCol, int size, long step, Move lastMove, String cells) {
            this.row = row;
            this.col = col;
            this.goalRow = goalRow;
            this.goalCol = goalCol;
            this.size = size;
            this.step = step;
            this.lastMove = lastMove;
            this.cells = cells;
        }

        /** '0' open, '1' wall, '2' start, '3' goal; off-grid cells read as walls. */
        public char cell(int r, int c) {
            if (r < 0 || c < 0 || r >= size || c >= size) {
                return '1';
            }
            return cells.charAt(r * size + c);
        }

        public boolean isOpen(Move mv) {
            int[] next = target(size, row, col, mv);
            return next != null && cell(next[0], next[1]) != '1';
        }
    }

    // ---- agent code: static Move nextMove(MazeView view) ----
"##;

const SUFFIX: &str = r##"    // ---- end of agent code ----

    static int[] target(int size, int row, int col, Move mv) {
        int r = row;
        int c = col;
        switch (mv) {
            case UP: r--; break;
            case DOWN: r++; break;
            case LEFT: c--; break;
            case RIGHT: c++; break;
            default: return null;
        }
        if (r < 0 || c < 0 || r >= size || c >= size) {
            return null;
        }
        return new int[] {r, c};
    }

    static String escape(String text) {
        StringBuilder out = new StringBuilder(text.length());
        for (int i = 0; i < text.length(); i++) {
            char ch = text.charAt(i);
            switch (ch) {
                case '\\': out.append("\\\\"); break;
                case '\n': out.append("\\n"); break;
                case '\r': out.append("\\r"); break;
                case '\t': out.append("\\t"); break;
                default: out.append(ch);
            }
        }
        return out.toString();
    }

    static String unescape(String text) {
        StringBuilder out = new StringBuilder(text.length());
        for (int i = 0; i < text.length(); i++) {
            char ch = text.charAt(i);
            if (ch != '\\') {
                out.append(ch);
                continue;
            }
            i++;
            if (i >= text.length()) {
                return null;
            }
            switch (text.charAt(i)) {
                case '\\': out.append('\\'); break;
                case 'n': out.append('\n'); break;
                case 'r': out.append('\r'); break;
                case 't': out.append('\t'); break;
                default: return null;
            }
        }
        return out.toString();
    }

    static char letter(Move mv) {
        switch (mv) {
            case UP: return 'U';
            case DOWN: return 'D';
            case LEFT: return 'L';
            case RIGHT: return 'R';
            default: return '-';
        }
    }

    static void emit(String nonce, String status, CharSequence path, String detail) {
        String shown = path.length() == 0 ? "-" : path.toString();
        System.out.flush();
        System.out.print("\n@@MAZE " + nonce + " " + status + " " + path.length() + " " + shown + " " + escape(detail) + "\n");
        System.out.flush();
    }

    static int drive() {
        String nonce = null;
        String maze = null;
        long limit = -1;
        try {
            BufferedReader in = new BufferedReader(new InputStreamReader(System.in, StandardCharsets.UTF_8));
            String line;
            while ((line = in.readLine()) != null) {
                int space = line.indexOf(' ');
                String key = space < 0 ? line : line.substring(0, space);
                String value = space < 0 ? "" : line.substring(space + 1);
                if (key.equals("end")) {
                    break;
                }
                switch (key) {
                    case "nonce": nonce = unescape(value); break;
                    case "limit": limit = Long.parseLong(value); break;
                    case "maze": maze = unescape(value); break;
                    default: break;
                }
            }
        } catch (IOException | NumberFormatException e) {
            nonce = null;
        }

        int size = 0;
        int length = maze == null ? 0 : maze.length();
        while (size * size < length) {
            size++;
        }
        int start = maze == null ? -1 : maze.indexOf('2');
        int goal = maze == null ? -1 : maze.indexOf('3');
        if (nonce == null || limit < 0 || start < 0 || goal < 0 || size * size != length) {
            System.err.println("maze harness: unreadable envelope");
            return 2;
        }

        int row = start / size;
        int col = start % size;
        int goalRow = goal / size;
        int goalCol = goal % size;
        long step = 0;
        Move last = null;
        StringBuilder path = new StringBuilder();

        while (true) {
            if (row == goalRow && col == goalCol) {
                emit(nonce, "solved", path, "reached the goal");
                return 0;
            }
            if (step >= limit) {
                emit(nonce, "failed", path, "step limit of " + limit + " reached");
                return 0;
            }

            Move mv;
            try {
                mv = nextMove(new MazeView(row, col, goalRow, goalCol, size, step, last, maze));
            } catch (Throwable t) {
                emit(nonce, "fault", path, "nextMove threw at step " + step + ": " + t);
                return 70;
            }

            if (mv == null || mv == Move.GIVE_UP) {
                emit(nonce, "failed", path, "gave up at step " + step);
                return 0;
            }

            int[] next = target(size, row, col, mv);
            if (next == null || maze.charAt(next[0] * size + next[1]) == '1') {
                emit(nonce, "failed", path, "blocked move " + mv + " at step " + step);
                return 0;
            }
            row = next[0];
            col = next[1];
            step++;
            last = mv;
            path.append(letter(mv));
        }
    }

    public static void main(String[] args) {
        System.exit(drive());
    }
}
"##;

fn profile(memory_mb: Option<u64>, process_limit: u32, cpu_ms: u64, wall_ms: u64) -> ExecutionProfile {
    ExecutionProfile {
        environment: vec![(
            "JAVA_TOOL_OPTIONS".to_string(),
            "-Dfile.encoding=UTF-8 -Dstdout.encoding=UTF-8".to_string(),
        )],
        preserve_env: vec!["PATH".to_string(), "JAVA_HOME".to_string()],
        memory_limit: memory_mb.map(|mb| mb * 1024 * 1024),
        process_limit: Some(process_limit),
        cpu_time_limit_ms: Some(cpu_ms),
        wall_time_limit_ms: Some(wall_ms),
        fd_limit: Some(256),
        isolate_network: true,
        isolate_processes: true,
        ..Default::default()
    }
}

impl LanguageAdapter for JavaAdapter {
    fn language(&self) -> &'static str {
        "java"
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
        // javac's JVM reserves address space well past its heap; bounded by -J-Xmx.
        ExecutionProfile {
            file_size_limit: Some(64 * 1024 * 1024),
            ..profile(None, 512, 30_000, 45_000)
        }
    }

    fn run_profile(&self) -> ExecutionProfile {
        ExecutionProfile {
            uid: Some(NOBODY),
            gid: Some(NOBODY),
            file_size_limit: Some(1024 * 1024),
            ..profile(Some(2048), 512, 10_000, 20_000)
        }
    }

    fn compile_command(&self, workspace: &Workspace) -> Vec<String> {
        vec![
            "javac".to_string(),
            "-J-Xmx512m".to_string(),
            "-proc:none".to_string(),
            "-nowarn".to_string(),
            "-encoding".to_string(),
            "UTF-8".to_string(),
            "-d".to_string(),
            workspace.dir().to_string_lossy().to_string(),
            workspace.path(SOURCE_FILE).to_string_lossy().to_string(),
        ]
    }

    fn run_command(&self, workspace: &Workspace) -> Vec<String> {
        vec![
            "java".to_string(),
            "-Xmx256m".to_string(),
            "-Xss8m".to_string(),
            "-XX:+UseSerialGC".to_string(),
            "-XX:TieredStopAtLevel=1".to_string(),
            "-XX:ReservedCodeCacheSize=32m".to_string(),
            "-XX:CompressedClassSpaceSize=32m".to_string(),
            "-XX:MaxMetaspaceSize=64m".to_string(),
            "-cp".to_string(),
            workspace.dir().to_string_lossy().to_string(),
            CLASS_NAME.to_string(),
        ]
    }

    fn version_command(&self) -> Vec<String> {
        vec!["javac".to_string(), "-version".to_string()]
    }
}
