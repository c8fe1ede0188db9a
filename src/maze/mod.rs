//! Maze layouts and the server-side move state machine.
//!
//! A layout is a square, row-major string of cell digits:
//! `0` open, `1` wall, `2` start, `3` goal. The same state machine is
//! compiled into every harness template; this copy replays the path a
//! child reports so the result never has to be taken on trust.

use crate::config::types::{MazeboxError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const OPEN: u8 = b'0';
pub const WALL: u8 = b'1';
pub const START: u8 = b'2';
pub const GOAL: u8 = b'3';

/// A single step decided by an agent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Move {
    Up,
    Down,
    Left,
    Right,
}

impl Move {
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'U' => Some(Move::Up),
            'D' => Some(Move::Down),
            'L' => Some(Move::Left),
            'R' => Some(Move::Right),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Move::Up => 'U',
            Move::Down => 'D',
            Move::Left => 'L',
            Move::Right => 'R',
        }
    }

    fn delta(self) -> (isize, isize) {
        match self {
            Move::Up => (-1, 0),
            Move::Down => (1, 0),
            Move::Left => (0, -1),
            Move::Right => (0, 1),
        }
    }
}

/// Grid position as (row, col)
pub type Position = (usize, usize);

/// Validated square maze
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MazeLayout {
    size: usize,
    cells: Vec<u8>,
    start: Position,
    goal: Position,
}

impl MazeLayout {
    /// Parse the digit-string wire form
    pub fn parse(text: &str) -> Result<Self> {
        let cells: Vec<u8> = text.trim().bytes().collect();
        if cells.len() < 4 {
            return Err(MazeboxError::InvalidLayout(format!(
                "layout needs at least 4 cells, got {}",
                cells.len()
            )));
        }

        let size = (cells.len() as f64).sqrt().round() as usize;
        if size * size != cells.len() {
            return Err(MazeboxError::InvalidLayout(format!(
                "layout length {} is not a perfect square",
                cells.len()
            )));
        }

        let mut start = None;
        let mut goal = None;
        for (index, cell) in cells.iter().enumerate() {
            let pos = (index / size, index % size);
            match *cell {
                OPEN | WALL => {}
                START if start.is_none() => start = Some(pos),
                GOAL if goal.is_none() => goal = Some(pos),
                START | GOAL => {
                    return Err(MazeboxError::InvalidLayout(format!(
                        "duplicate {} cell at {:?}",
                        if *cell == START { "start" } else { "goal" },
                        pos
                    )))
                }
                other => {
                    return Err(MazeboxError::InvalidLayout(format!(
                        "unknown cell value {:?} at {:?}",
                        other as char, pos
                    )))
                }
            }
        }

        let start = start.ok_or_else(|| MazeboxError::InvalidLayout("missing start cell".to_string()))?;
        let goal = goal.ok_or_else(|| MazeboxError::InvalidLayout("missing goal cell".to_string()))?;

        Ok(Self {
            size,
            cells,
            start,
            goal,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn goal(&self) -> Position {
        self.goal
    }

    pub fn cell(&self, pos: Position) -> Option<u8> {
        if pos.0 < self.size && pos.1 < self.size {
            Some(self.cells[pos.0 * self.size + pos.1])
        } else {
            None
        }
    }

    /// Target of `mv` from `pos` when it stays on the grid and off walls
    pub fn step(&self, pos: Position, mv: Move) -> Option<Position> {
        let (dr, dc) = mv.delta();
        let row = pos.0.checked_add_signed(dr)?;
        let col = pos.1.checked_add_signed(dc)?;
        match self.cell((row, col))? {
            WALL => None,
            _ => Some((row, col)),
        }
    }

    /// Wire form sent to the child
    pub fn serialize(&self) -> String {
        String::from_utf8_lossy(&self.cells).into_owned()
    }
}

impl fmt::Display for MazeLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.cells.chunks(self.size) {
            writeln!(f, "{}", String::from_utf8_lossy(row))?;
        }
        Ok(())
    }
}

impl TryFrom<String> for MazeLayout {
    type Error = MazeboxError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<MazeLayout> for String {
    fn from(layout: MazeLayout) -> Self {
        layout.serialize()
    }
}

/// Why a replayed path stopped short
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayError {
    UnknownMove { index: usize, letter: char },
    Blocked { index: usize, from: Position, mv: Move },
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::UnknownMove { index, letter } => {
                write!(f, "unknown move {:?} at step {}", letter, index)
            }
            ReplayError::Blocked { index, from, mv } => {
                write!(f, "move {:?} from {:?} at step {} is blocked", mv, from, index)
            }
        }
    }
}

/// Position of an agent walking a layout
#[derive(Clone, Debug)]
pub struct MazeState<'a> {
    layout: &'a MazeLayout,
    position: Position,
    moves: usize,
}

impl<'a> MazeState<'a> {
    pub fn new(layout: &'a MazeLayout) -> Self {
        Self {
            layout,
            position: layout.start(),
            moves: 0,
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn moves(&self) -> usize {
        self.moves
    }

    pub fn at_goal(&self) -> bool {
        self.position == self.layout.goal()
    }

    /// Apply one move; a blocked move leaves the state untouched
    pub fn apply(&mut self, mv: Move) -> bool {
        match self.layout.step(self.position, mv) {
            Some(next) => {
                self.position = next;
                self.moves += 1;
                true
            }
            None => false,
        }
    }

    /// Replay a `UDLR` path from the start cell
    pub fn replay(layout: &'a MazeLayout, path: &str) -> std::result::Result<Self, ReplayError> {
        let mut state = Self::new(layout);
        for (index, letter) in path.chars().enumerate() {
            let mv = Move::from_letter(letter).ok_or(ReplayError::UnknownMove { index, letter })?;
            if !state.apply(mv) {
                return Err(ReplayError::Blocked {
                    index,
                    from: state.position,
                    mv,
                });
            }
        }
        Ok(state)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 4x4 sample whose shortest path is `RRDDDR` (6 moves)
    pub(crate) const SAMPLE: &str = "2001110100010103";

    #[test]
    fn test_parse_sample() {
        let layout = MazeLayout::parse(SAMPLE).unwrap();
        assert_eq!(layout.size(), 4);
        assert_eq!(layout.start(), (0, 0));
        assert_eq!(layout.goal(), (3, 3));
        assert_eq!(layout.serialize(), SAMPLE);
    }

    #[test]
    fn test_parse_rejects_bad_layouts() {
        assert!(MazeLayout::parse("20013").is_err()); // not square
        assert!(MazeLayout::parse("0000").is_err()); // no start
        assert!(MazeLayout::parse("2000").is_err()); // no goal
        assert!(MazeLayout::parse("2232").is_err()); // two starts
        assert!(MazeLayout::parse("20x3").is_err()); // unknown cell
        assert!(MazeLayout::parse("23").is_err()); // too small
    }

    #[test]
    fn test_step_respects_walls_and_edges() {
        let layout = MazeLayout::parse(SAMPLE).unwrap();
        assert_eq!(layout.step((0, 0), Move::Right), Some((0, 1)));
        assert_eq!(layout.step((0, 0), Move::Down), None); // wall
        assert_eq!(layout.step((0, 0), Move::Up), None); // off grid
        assert_eq!(layout.step((0, 0), Move::Left), None); // off grid
    }

    #[test]
    fn test_replay_shortest_path() {
        let layout = MazeLayout::parse(SAMPLE).unwrap();
        let state = MazeState::replay(&layout, "RRDDDR").unwrap();
        assert!(state.at_goal());
        assert_eq!(state.moves(), 6);
    }

    #[test]
    fn test_replay_reports_blocked_move() {
        let layout = MazeLayout::parse(SAMPLE).unwrap();
        let err = MazeState::replay(&layout, "RD").unwrap_err();
        assert_eq!(
            err,
            ReplayError::Blocked {
                index: 1,
                from: (0, 1),
                mv: Move::Down
            }
        );
        assert!(matches!(
            MazeState::replay(&layout, "RX"),
            Err(ReplayError::UnknownMove { index: 1, letter: 'X' })
        ));
    }

    #[test]
    fn test_layout_serde_uses_wire_form() {
        let layout = MazeLayout::parse(SAMPLE).unwrap();
        let json = serde_json::to_string(&layout).unwrap();
        assert_eq!(json, format!("\"{}\"", SAMPLE));
        let back: MazeLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(back, layout);
    }
}
