//! Tic-Tac-Toe sessions — deterministic move validation and resync.
//!
//! Both peers hold a full copy of the game and validate every MOVE against
//! it: position in range, cell empty, correct turn, MOVE_NO exactly one
//! past ours. Win and draw detection are local and deterministic, so two
//! peers fed the same accepted moves conclude identically. A rejected MOVE
//! triggers a RESYNC carrying the rejecting side's board snapshot; the
//! snapshot with the higher move count wins reconciliation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Instant;

use lsnp_core::UserId;

// ── Symbols and board ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    X,
    O,
}

impl Symbol {
    pub fn opposite(self) -> Symbol {
        match self {
            Symbol::X => Symbol::O,
            Symbol::O => Symbol::X,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Symbol::X => "X",
            Symbol::O => "O",
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Symbol {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "X" => Ok(Symbol::X),
            "O" => Ok(Symbol::O),
            other => Err(GameError::BadSymbol(other.to_string())),
        }
    }
}

pub type Board = [Option<Symbol>; 9];

const WIN_LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

pub fn winner(board: &Board) -> Option<Symbol> {
    for line in WIN_LINES {
        if let Some(s) = board[line[0]] {
            if board[line[1]] == Some(s) && board[line[2]] == Some(s) {
                return Some(s);
            }
        }
    }
    None
}

pub fn is_full(board: &Board) -> bool {
    board.iter().all(|c| c.is_some())
}

/// Wire form of the board: nine chars of `X`, `O`, or `.`.
pub fn encode_board(board: &Board) -> String {
    board
        .iter()
        .map(|c| match c {
            Some(Symbol::X) => 'X',
            Some(Symbol::O) => 'O',
            None => '.',
        })
        .collect()
}

pub fn decode_board(s: &str) -> Result<Board, GameError> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() != 9 {
        return Err(GameError::BadBoard(s.to_string()));
    }
    let mut board: Board = [None; 9];
    for (i, c) in chars.iter().enumerate() {
        board[i] = match c {
            'X' => Some(Symbol::X),
            'O' => Some(Symbol::O),
            '.' => None,
            _ => return Err(GameError::BadBoard(s.to_string())),
        };
    }
    Ok(board)
}

// ── Game state machine ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOutcome {
    Won,
    Lost,
    Drawn,
    Abandoned,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    Invited,
    Active,
    Over(GameOutcome),
}

/// What an accepted move did to the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    InProgress,
    Won(Symbol),
    Drawn,
}

#[derive(Debug)]
pub struct Game {
    pub game_id: String,
    pub opponent: UserId,
    /// Our symbol. X always moves first.
    pub symbol: Symbol,
    pub board: Board,
    pub turn: Symbol,
    pub move_no: u32,
    pub phase: GamePhase,
    pub invited_at: Instant,
}

impl Game {
    pub fn new(game_id: String, opponent: UserId, symbol: Symbol) -> Self {
        Self {
            game_id,
            opponent,
            symbol,
            board: [None; 9],
            turn: Symbol::X,
            move_no: 0,
            phase: GamePhase::Invited,
            invited_at: Instant::now(),
        }
    }

    pub fn activate(&mut self) {
        self.phase = GamePhase::Active;
        self.board = [None; 9];
        self.turn = Symbol::X;
        self.move_no = 0;
    }

    /// Validate and apply one move, ours or the opponent's. Every rejection
    /// is a protocol violation the caller answers with RESYNC (for remote
    /// moves) or surfaces to the UI (for local ones).
    pub fn apply_move(
        &mut self,
        move_no: u32,
        position: u32,
        player: Symbol,
    ) -> Result<MoveOutcome, MoveError> {
        if self.phase != GamePhase::Active {
            return Err(MoveError::NotActive);
        }
        if position > 8 {
            return Err(MoveError::OutOfRange(position));
        }
        if player != self.turn {
            return Err(MoveError::NotYourTurn {
                player,
                turn: self.turn,
            });
        }
        if move_no != self.move_no + 1 {
            return Err(MoveError::MoveNoMismatch {
                expected: self.move_no + 1,
                got: move_no,
            });
        }
        let cell = &mut self.board[position as usize];
        if cell.is_some() {
            return Err(MoveError::CellOccupied(position));
        }
        *cell = Some(player);
        self.move_no = move_no;
        self.turn = player.opposite();

        if let Some(winning) = winner(&self.board) {
            self.phase = GamePhase::Over(if winning == self.symbol {
                GameOutcome::Won
            } else {
                GameOutcome::Lost
            });
            return Ok(MoveOutcome::Won(winning));
        }
        if is_full(&self.board) {
            self.phase = GamePhase::Over(GameOutcome::Drawn);
            return Ok(MoveOutcome::Drawn);
        }
        Ok(MoveOutcome::InProgress)
    }

    /// Our snapshot for a RESYNC frame.
    pub fn snapshot(&self) -> (String, u32) {
        (encode_board(&self.board), self.move_no)
    }

    /// Reconcile against the opponent's snapshot: theirs wins iff it has
    /// seen strictly more moves. Turn parity re-derives from the move count
    /// (X always first), and a finished board settles the phase.
    pub fn reconcile(&mut self, board: Board, move_no: u32) -> bool {
        if move_no <= self.move_no {
            return false;
        }
        self.board = board;
        self.move_no = move_no;
        self.turn = if move_no % 2 == 0 { Symbol::X } else { Symbol::O };
        if let Some(winning) = winner(&self.board) {
            self.phase = GamePhase::Over(if winning == self.symbol {
                GameOutcome::Won
            } else {
                GameOutcome::Lost
            });
        } else if is_full(&self.board) {
            self.phase = GamePhase::Over(GameOutcome::Drawn);
        } else {
            self.phase = GamePhase::Active;
        }
        true
    }

    /// A resignation ends the game in the resigner's loss.
    pub fn resign(&mut self, by_us: bool) {
        self.phase = GamePhase::Over(if by_us {
            GameOutcome::Lost
        } else {
            GameOutcome::Won
        });
    }

    pub fn abandon(&mut self) {
        self.phase = GamePhase::Over(GameOutcome::Abandoned);
    }

    pub fn cancel(&mut self) {
        self.phase = GamePhase::Over(GameOutcome::Cancelled);
    }

    pub fn is_active(&self) -> bool {
        self.phase == GamePhase::Active
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// Games by id. One mutex over the whole map: moves are rare and handlers
/// hold the lock only across a single validation.
#[derive(Default)]
pub struct GameTable {
    games: Mutex<HashMap<String, Game>>,
}

impl GameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, game: Game) {
        self.games
            .lock()
            .expect("game table lock poisoned")
            .insert(game.game_id.clone(), game);
    }

    pub fn remove(&self, game_id: &str) -> Option<Game> {
        self.games
            .lock()
            .expect("game table lock poisoned")
            .remove(game_id)
    }

    /// Run a closure against one game under the lock.
    pub fn with_game<T>(&self, game_id: &str, f: impl FnOnce(&mut Game) -> T) -> Option<T> {
        self.games
            .lock()
            .expect("game table lock poisoned")
            .get_mut(game_id)
            .map(f)
    }

    /// Ids of active games against a given opponent (abandonment sweep).
    pub fn active_against(&self, opponent: &UserId) -> Vec<String> {
        self.games
            .lock()
            .expect("game table lock poisoned")
            .values()
            .filter(|g| g.is_active() && g.opponent == *opponent)
            .map(|g| g.game_id.clone())
            .collect()
    }

    /// Invites older than the timeout, for cancellation.
    pub fn expired_invites(&self, timeout: std::time::Duration) -> Vec<String> {
        self.games
            .lock()
            .expect("game table lock poisoned")
            .values()
            .filter(|g| g.phase == GamePhase::Invited && g.invited_at.elapsed() > timeout)
            .map(|g| g.game_id.clone())
            .collect()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Move rejections — the protocol_violation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MoveError {
    #[error("game is not active")]
    NotActive,

    #[error("position {0} out of range")]
    OutOfRange(u32),

    #[error("cell {0} already occupied")]
    CellOccupied(u32),

    #[error("{player} played out of turn (turn is {turn})")]
    NotYourTurn { player: Symbol, turn: Symbol },

    #[error("move number {got}, expected {expected}")]
    MoveNoMismatch { expected: u32, got: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("bad symbol {0:?}")]
    BadSymbol(String),

    #[error("bad board snapshot {0:?}")]
    BadBoard(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bob() -> UserId {
        "bob@192.168.1.11".parse().unwrap()
    }

    fn active_game(symbol: Symbol) -> Game {
        let mut game = Game::new("g1".into(), bob(), symbol);
        game.activate();
        game
    }

    #[test]
    fn x_wins_on_the_diagonal() {
        // X takes 4, 2, 6 — the anti-diagonal.
        let mut game = active_game(Symbol::X);
        assert_eq!(
            game.apply_move(1, 4, Symbol::X).unwrap(),
            MoveOutcome::InProgress
        );
        assert_eq!(
            game.apply_move(2, 0, Symbol::O).unwrap(),
            MoveOutcome::InProgress
        );
        assert_eq!(
            game.apply_move(3, 2, Symbol::X).unwrap(),
            MoveOutcome::InProgress
        );
        assert_eq!(
            game.apply_move(4, 3, Symbol::O).unwrap(),
            MoveOutcome::InProgress
        );
        assert_eq!(
            game.apply_move(5, 6, Symbol::X).unwrap(),
            MoveOutcome::Won(Symbol::X)
        );
        assert_eq!(game.phase, GamePhase::Over(GameOutcome::Won));
    }

    #[test]
    fn both_sides_conclude_identically() {
        let moves = [(1, 4, Symbol::X), (2, 0, Symbol::O), (3, 2, Symbol::X),
                     (4, 3, Symbol::O), (5, 6, Symbol::X)];
        let mut as_x = active_game(Symbol::X);
        let mut as_o = active_game(Symbol::O);
        for (no, pos, player) in moves {
            as_x.apply_move(no, pos, player).unwrap();
            as_o.apply_move(no, pos, player).unwrap();
        }
        assert_eq!(as_x.board, as_o.board);
        assert_eq!(as_x.move_no, as_o.move_no);
        assert_eq!(as_x.phase, GamePhase::Over(GameOutcome::Won));
        assert_eq!(as_o.phase, GamePhase::Over(GameOutcome::Lost));
    }

    #[test]
    fn occupied_cell_rejected() {
        let mut game = active_game(Symbol::X);
        game.apply_move(1, 4, Symbol::X).unwrap();
        assert_eq!(
            game.apply_move(2, 4, Symbol::O),
            Err(MoveError::CellOccupied(4))
        );
        // The cell kept its first value (empty→mark exactly once).
        assert_eq!(game.board[4], Some(Symbol::X));
    }

    #[test]
    fn out_of_turn_and_range_rejected() {
        let mut game = active_game(Symbol::X);
        assert_eq!(
            game.apply_move(1, 0, Symbol::O),
            Err(MoveError::NotYourTurn {
                player: Symbol::O,
                turn: Symbol::X
            })
        );
        assert_eq!(game.apply_move(1, 9, Symbol::X), Err(MoveError::OutOfRange(9)));
    }

    #[test]
    fn move_no_gap_rejected() {
        let mut game = active_game(Symbol::X);
        assert_eq!(
            game.apply_move(2, 0, Symbol::X),
            Err(MoveError::MoveNoMismatch {
                expected: 1,
                got: 2
            })
        );
    }

    #[test]
    fn move_no_tracks_filled_cells() {
        let mut game = active_game(Symbol::X);
        game.apply_move(1, 0, Symbol::X).unwrap();
        game.apply_move(2, 1, Symbol::O).unwrap();
        let filled = game.board.iter().filter(|c| c.is_some()).count() as u32;
        assert_eq!(game.move_no, filled);
    }

    #[test]
    fn draw_detected() {
        // X O X / X O O / O X X — full, no line.
        let mut game = active_game(Symbol::X);
        for (no, pos, player) in [
            (1, 0, Symbol::X),
            (2, 1, Symbol::O),
            (3, 2, Symbol::X),
            (4, 4, Symbol::O),
            (5, 3, Symbol::X),
            (6, 5, Symbol::O),
            (7, 7, Symbol::X),
            (8, 6, Symbol::O),
        ] {
            assert_eq!(game.apply_move(no, pos, player).unwrap(), MoveOutcome::InProgress);
        }
        assert_eq!(game.apply_move(9, 8, Symbol::X).unwrap(), MoveOutcome::Drawn);
        assert_eq!(game.phase, GamePhase::Over(GameOutcome::Drawn));
    }

    #[test]
    fn board_codec_round_trip() {
        let mut game = active_game(Symbol::X);
        game.apply_move(1, 4, Symbol::X).unwrap();
        game.apply_move(2, 0, Symbol::O).unwrap();
        let (encoded, move_no) = game.snapshot();
        assert_eq!(encoded, "O...X....");
        assert_eq!(move_no, 2);
        assert_eq!(decode_board(&encoded).unwrap(), game.board);

        assert!(decode_board("XO").is_err());
        assert!(decode_board("XO??.....").is_err());
    }

    #[test]
    fn reconcile_takes_the_longer_history() {
        let mut behind = active_game(Symbol::O);
        behind.apply_move(1, 4, Symbol::X).unwrap();

        let mut ahead = active_game(Symbol::X);
        ahead.apply_move(1, 4, Symbol::X).unwrap();
        ahead.apply_move(2, 0, Symbol::O).unwrap();
        ahead.apply_move(3, 8, Symbol::X).unwrap();

        let (board, move_no) = ahead.snapshot();
        assert!(behind.reconcile(decode_board(&board).unwrap(), move_no));
        assert_eq!(behind.move_no, 3);
        assert_eq!(behind.turn, Symbol::O);

        // The shorter history never displaces the longer one.
        let (board, move_no) = behind.snapshot();
        let mut current = ahead;
        assert!(!current.reconcile(decode_board(&board).unwrap(), move_no));
    }

    #[test]
    fn resignation_assigns_the_loss() {
        let mut game = active_game(Symbol::X);
        game.resign(true);
        assert_eq!(game.phase, GamePhase::Over(GameOutcome::Lost));

        let mut game = active_game(Symbol::X);
        game.resign(false);
        assert_eq!(game.phase, GamePhase::Over(GameOutcome::Won));
    }

    #[test]
    fn table_finds_active_games_for_sweep() {
        let table = GameTable::new();
        let mut game = Game::new("g1".into(), bob(), Symbol::X);
        game.activate();
        table.insert(game);
        table.insert(Game::new("g2".into(), bob(), Symbol::X));

        assert_eq!(table.active_against(&bob()), vec!["g1".to_string()]);
    }
}
