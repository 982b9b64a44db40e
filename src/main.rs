mod ui;

use anzan::{
    api::{ApiClient, DEFAULT_TIMEOUT},
    app_dirs::AppDirs,
    config::{Config, ConfigStore, FileConfigStore},
    exercise::{Backend, ExerciseSession, Phase},
    runtime::{AnzanEvent, AnzanEventSource, CrosstermEventSource, FixedTicker, Runner, ThreadDispatcher, Ticker},
    session::SessionConfig,
    speech::CommandSpeaker,
    stats::{AttemptRow, StatsDb},
};
use clap::{error::ErrorKind, CommandFactory, Parser};
use crossterm::{
    event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    tty::IsTty,
};
use ratatui::{
    backend::{Backend as TerminalBackend, CrosstermBackend},
    Frame, Terminal,
};
use std::{
    error::Error,
    fs::OpenOptions,
    io::{self, stdin},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TICK_RATE_MS: u64 = 100;
const HISTORY_LEN: usize = 5;
/// How long exit waits for background writes after teardown
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// flash mental arithmetic in the terminal
#[derive(Parser, Debug, Clone)]
#[clap(
    version,
    about,
    long_about = "Flash anzan trainer: numbers flash one at a time, optionally read aloud, then you type the total before the clock runs out. Attempts are recorded locally or against a remote exercise API."
)]
pub struct Cli {
    /// base url of the exercise API; practice offline when omitted
    #[clap(long)]
    api_url: Option<String>,

    /// bearer token for the exercise API
    #[clap(long)]
    token: Option<String>,

    /// student id the attempt is recorded for
    #[clap(short = 'u', long)]
    student: Option<String>,

    /// exercise type: addition or mixed
    #[clap(short = 'e', long)]
    exercise: Option<String>,

    /// numbers flashed per round
    #[clap(short = 'c', long)]
    cards: Option<usize>,

    /// digits per number
    #[clap(short = 'd', long)]
    digits: Option<u8>,

    /// seconds each number stays on screen
    #[clap(short = 's', long)]
    speed: Option<f64>,

    /// seconds allowed to answer
    #[clap(short = 't', long)]
    time: Option<u32>,

    /// smallest operand (overrides --digits)
    #[clap(long, allow_hyphen_values = true)]
    min: Option<i64>,

    /// largest operand (overrides --digits)
    #[clap(long, allow_hyphen_values = true)]
    max: Option<i64>,

    /// read the numbers aloud (needs espeak)
    #[clap(long, conflicts_with = "mute")]
    speak: bool,

    /// turn off speech saved in the config
    #[clap(long)]
    mute: bool,

    /// espeak voice
    #[clap(long)]
    voice: Option<String>,

    /// remember these settings as the new defaults
    #[clap(long)]
    save: bool,
}

impl Cli {
    /// Layers the flags that were given over the stored config
    fn apply(&self, mut cfg: Config) -> Config {
        if let Some(url) = &self.api_url {
            cfg.api_url = Some(url.clone());
        }
        if let Some(token) = &self.token {
            cfg.token = Some(token.clone());
        }
        if let Some(student) = &self.student {
            cfg.student = student.clone();
        }
        if let Some(exercise) = &self.exercise {
            cfg.exercise_type = exercise.clone();
        }
        cfg.card_count = self.cards.unwrap_or(cfg.card_count);
        cfg.digit_length = self.digits.unwrap_or(cfg.digit_length);
        cfg.display_speed = self.speed.unwrap_or(cfg.display_speed);
        cfg.time_per_question = self.time.unwrap_or(cfg.time_per_question);
        cfg.min = self.min.or(cfg.min);
        cfg.max = self.max.or(cfg.max);
        if self.speak {
            cfg.speak = true;
        }
        if self.mute {
            cfg.speak = false;
        }
        if let Some(voice) = &self.voice {
            cfg.voice = Some(voice.clone());
        }
        cfg
    }
}

pub struct App {
    pub session: ExerciseSession,
    pub should_quit: bool,
    quit_requested: bool,
    history: Option<Arc<StatsDb>>,
    pub past_attempts: Vec<AttemptRow>,
}

impl App {
    pub fn new(session: ExerciseSession) -> Self {
        Self {
            session,
            should_quit: false,
            quit_requested: false,
            history: None,
            past_attempts: Vec::new(),
        }
    }

    /// Shows the student's recent attempts from `db` once the session is saved
    pub fn with_history(mut self, db: Arc<StatsDb>) -> Self {
        self.history = Some(db);
        self
    }

    pub fn is_quitting(&self) -> bool {
        self.quit_requested && !self.should_quit
    }

    pub fn on_key(&mut self, key: KeyEvent) {
        self.handle_key(key);
        self.settle();
    }

    fn request_quit(&mut self) {
        self.session.end_session();
        self.quit_requested = true;
    }

    fn handle_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            // a second ctrl+c leaves without waiting for the backend
            if self.quit_requested {
                self.should_quit = true;
            }
            self.request_quit();
            return;
        }

        let session = &mut self.session;
        match session.phase() {
            Phase::AwaitingAnswer => match key.code {
                KeyCode::Enter => {
                    session.submit();
                }
                KeyCode::Backspace => session.backspace(),
                KeyCode::Esc | KeyCode::Char('q') => session.end_session(),
                KeyCode::Char('n') => {
                    session.next_round();
                }
                KeyCode::Char(c) => {
                    session.input_char(c);
                }
                _ => {}
            },
            Phase::Completed => match key.code {
                KeyCode::Enter => {
                    if session.achievements().is_empty() {
                        self.quit_requested = true;
                    } else {
                        session.acknowledge_achievement();
                    }
                }
                KeyCode::Esc | KeyCode::Char('q') => self.quit_requested = true,
                _ => {}
            },
            Phase::Failed => match key.code {
                KeyCode::Enter | KeyCode::Char('r') => {
                    let retried = session.attempt_id().is_some() && session.next_round();
                    if !retried {
                        if let Err(e) = session.start() {
                            tracing::error!("could not restart session: {}", e);
                        }
                    }
                }
                KeyCode::Esc | KeyCode::Char('q') => session.end_session(),
                _ => {}
            },
            Phase::Idle => match key.code {
                KeyCode::Enter => {
                    if let Err(e) = session.start() {
                        tracing::error!("could not start session: {}", e);
                    }
                }
                KeyCode::Esc | KeyCode::Char('q') => self.request_quit(),
                _ => {}
            },
            phase => match key.code {
                KeyCode::Char('n') => {
                    session.next_round();
                }
                KeyCode::Enter if phase == Phase::Feedback => {
                    session.next_round();
                }
                KeyCode::Esc | KeyCode::Char('q') => session.end_session(),
                _ => {}
            },
        }
    }

    pub fn on_event(&mut self, event: AnzanEvent) {
        match event {
            AnzanEvent::Key(key) if key.kind == KeyEventKind::Press => self.on_key(key),
            AnzanEvent::Job(completion) => self.session.on_completion(completion),
            AnzanEvent::Key(_) | AnzanEvent::Resize | AnzanEvent::Tick => {}
        }
        // deadlines are polled after every event so a stream of keys can't starve them
        self.session.on_tick();
        self.settle();
    }

    /// Quits once nothing is left to write, and loads history after the final save
    fn settle(&mut self) {
        if self.session.phase() != Phase::Completed || self.session.has_pending_writes() {
            return;
        }
        if let Some(db) = self.history.take() {
            match db.recent_attempts(self.session.student_id(), HISTORY_LEN) {
                Ok(rows) => self.past_attempts = rows,
                Err(e) => tracing::warn!("could not load recent attempts: {}", e),
            }
        }
        if self.quit_requested {
            self.should_quit = true;
        }
    }
}

fn init_logging() {
    let Some(path) = AppDirs::log_path() else {
        return;
    };
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
        return;
    };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("ANZAN_LOG")
                .unwrap_or_else(|_| "anzan=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init();
}

/// The session backend, plus the local store when attempts are kept on disk
fn build_backend(
    cfg: &Config,
    session_config: &SessionConfig,
) -> Result<(Backend, Option<Arc<StatsDb>>), Box<dyn Error>> {
    match &cfg.api_url {
        Some(url) => {
            tracing::info!("using exercise API at {}", url);
            let client = ApiClient::new(url, cfg.token.clone(), DEFAULT_TIMEOUT)?;
            Ok((Backend::remote(client), None))
        }
        None => {
            let db = Arc::new(StatsDb::new()?);
            Ok((Backend::local(db.clone(), session_config.kind()), Some(db)))
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if !stdin().is_tty() {
        let mut cmd = Cli::command();
        cmd.error(ErrorKind::Io, "stdin must be a tty").exit();
    }

    init_logging();

    let store = FileConfigStore::new();
    let cfg = cli.apply(store.load());
    if cli.save {
        store.save(&cfg)?;
        tracing::info!("saved settings to {}", store.path().display());
    }
    let session_config = cfg.session_config();
    session_config.validate()?;
    let (backend, local_db) = build_backend(&cfg, &session_config)?;

    enable_raw_mode()?;

    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let terminal_backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(terminal_backend)?;

    let events = CrosstermEventSource::new();
    let dispatcher = ThreadDispatcher::new(events.sender());
    let mut session =
        ExerciseSession::new(session_config, cfg.student.clone(), backend, dispatcher.clone());
    if let Some(opts) = cfg.speech_options() {
        session = session.with_speaker(CommandSpeaker::default(), opts);
    }
    let mut app = App::new(session);
    if let Some(db) = local_db {
        app = app.with_history(db);
    }
    let runner = Runner::new(events, FixedTicker::new(Duration::from_millis(TICK_RATE_MS)));

    let result = match app.session.start() {
        Ok(_) => start_tui(&mut terminal, &mut app, &runner),
        Err(e) => Err(e.into()),
    };

    // finalize before the terminal goes back to the shell
    app.session.dispose();
    if !dispatcher.wait_idle(EXIT_GRACE) {
        tracing::error!(
            "{} background writes still running at exit; they are lost",
            dispatcher.in_flight()
        );
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen,)?;
    terminal.show_cursor()?;

    result
}

fn start_tui<B: TerminalBackend, E: AnzanEventSource, T: Ticker>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    runner: &Runner<E, T>,
) -> Result<(), Box<dyn Error>> {
    terminal.draw(|f| ui(app, f))?;

    while !app.should_quit {
        app.on_event(runner.step());
        terminal.draw(|f| ui(app, f))?;
    }

    Ok(())
}

fn ui(app: &App, f: &mut Frame) {
    f.render_widget(app, f.area());
}
