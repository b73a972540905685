// ThinLisp REPL - Interactive Reader
//
// Reads expressions a line at a time, echoes each completed value through
// the printer and shows what is missing while an expression is open.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::error::Error;
use thinlisp::printer::print_to_string;
use thinlisp::store::{attach, persist};
use thinlisp::streams::{LineFeed, StrSource, StringSink};
use thinlisp::{
    Bistack, BlockStore, Config, ExternalMemory, NvMem, Outcome, PrintStatus, Printer, ReadStatus, Reader, Recovery,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONFIG_VAR: &str = "THINLISP_CONFIG";

struct Session {
    config: Config,
    arena: Bistack,
    store: Option<NvMem>,
    reader: Reader,
    printer: Printer,
    guard: Recovery,
}

impl Session {
    fn new(config: Config) -> Result<Self, Box<dyn Error>> {
        let arena = config.arena()?;
        let store = config.store()?;
        let guard = Recovery::establish(&arena);
        info!(arena = config.arena_size, store = config.store_size, "session ready");
        Ok(Self {
            reader: Reader::new(config.reader_options()),
            printer: Printer::new(config.print),
            config,
            arena,
            store,
            guard,
        })
    }

    /// Read every complete expression available in `feed`, printing each
    /// value. Returns false if input was rejected.
    fn drain(&mut self, feed: &mut LineFeed) -> bool {
        loop {
            match self.guard.read(&mut self.arena, &mut self.reader, feed) {
                Outcome::Value(at) => {
                    self.show(at);
                    if let Err(e) = self.guard.release(&mut self.arena) {
                        warn!(%e, "cannot release value");
                    }
                }
                Outcome::Pending => return true,
                Outcome::Rejected(e) => {
                    eprintln!("Read error: {}", e);
                    feed.clear();
                    return false;
                }
                Outcome::Aborted(f) => {
                    eprintln!("Aborted: {}", f);
                    self.printer.reset();
                    feed.clear();
                    return false;
                }
            }
        }
    }

    fn show(&mut self, at: thinlisp::CellRef) {
        let external: &dyn ExternalMemory = match &self.store {
            Some(store) => store,
            None => &(),
        };
        match print_to_string(&mut self.arena, external, at, self.config.print) {
            Ok(text) => println!("{}", text),
            Err(f) => eprintln!("Print error: {}", f),
        }
    }

    /// Text that would close the expression being read.
    fn missing(&mut self) -> Option<String> {
        if self.reader.is_idle() && !self.reader.pending_prefix() {
            return None;
        }
        let mut sink = StringSink::new();
        match self.printer.put_missing(&self.arena, &self.reader, &mut sink) {
            Ok(PrintStatus::Done) => Some(sink.take()),
            Ok(PrintStatus::Blocked) => None,
            Err(f) => {
                debug!(%f, "no hint");
                None
            }
        }
    }

    fn abandon_input(&mut self) {
        self.reader.reset();
        self.printer.reset();
        if let Err(e) = self.guard.release(&mut self.arena) {
            warn!(%e, "cannot release input");
        }
    }

    fn command(&mut self, line: &str) -> bool {
        let mut words = line.splitn(2, char::is_whitespace);
        let name = words.next().unwrap_or("");
        let rest = words.next().unwrap_or("").trim();
        match name {
            "quit" => return false,
            "stats" => {
                let stats = self.arena.stats();
                println!(
                    "arena {} bytes: {} forward, {} backward, {} free",
                    stats.capacity, stats.forward_used, stats.backward_used, stats.free
                );
                if let Some(store) = &self.store {
                    println!("store {} bytes free", store.free_space());
                }
            }
            "blocks" => match &self.store {
                Some(store) => {
                    for block in store.blocks().filter(|b| !b.free) {
                        println!("{:#06x} {} bytes", block.address, block.capacity);
                    }
                }
                None => println!("No store configured."),
            },
            "save" => self.save(rest),
            "load" => match parse_address(rest) {
                Some(block) => self.load(block),
                None => println!("Usage: :load <block>"),
            },
            "free" => match (parse_address(rest), self.store.as_mut()) {
                (Some(block), Some(store)) => {
                    if let Err(e) = store.free(block) {
                        eprintln!("Store error: {}", e);
                    }
                }
                (None, _) => println!("Usage: :free <block>"),
                (_, None) => println!("No store configured."),
            },
            _ => println!("Commands: :save <expr>, :load <block>, :free <block>, :blocks, :stats, :quit"),
        }
        true
    }

    fn save(&mut self, text: &str) {
        let Some(store) = self.store.as_mut() else {
            println!("No store configured.");
            return;
        };
        let mut reader = Reader::new(self.config.reader_options());
        let read = reader
            .read(&mut self.arena, &mut StrSource::new(text))
            .and_then(|status| match status {
                ReadStatus::Pending => reader.read(&mut self.arena, &mut StrSource::new("\n")),
                done => Ok(done),
            });
        match read {
            Ok(ReadStatus::Done(at)) => match persist(&mut self.arena, store, at) {
                Ok(block) => println!("Saved at {:#06x}", block),
                Err(f) => eprintln!("Store error: {}", f),
            },
            Ok(ReadStatus::Pending) => println!("Incomplete expression."),
            Err(e) => eprintln!("Read error: {}", e),
        }
        if let Err(e) = self.guard.release(&mut self.arena) {
            warn!(%e, "cannot release saved value");
        }
    }

    fn load(&mut self, block: u16) {
        let Some(store) = &self.store else {
            println!("No store configured.");
            return;
        };
        match attach(&mut self.arena, store, block) {
            Ok(at) => self.show(at),
            Err(f) => eprintln!("Store error: {}", f),
        }
        if let Err(e) = self.guard.release(&mut self.arena) {
            warn!(%e, "cannot release loaded value");
        }
    }
}

fn parse_address(text: &str) -> Option<u16> {
    match text.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn load_config() -> Result<Config, Box<dyn Error>> {
    match std::env::var(CONFIG_VAR) {
        Ok(path) => {
            info!(%path, "loading config");
            Ok(Config::load(path)?)
        }
        Err(_) => Ok(Config::default()),
    }
}

/// Read and echo every expression in a file.
fn run_file(session: &mut Session, path: &str) -> Result<(), Box<dyn Error>> {
    let text = std::fs::read_to_string(path)?;
    let mut feed = LineFeed::new();
    for line in text.lines() {
        feed.push_line(line);
        session.drain(&mut feed);
    }
    if let Some(missing) = session.missing() {
        eprintln!("Incomplete expression at end of {}, missing: {}", path, missing);
        session.abandon_input();
    }
    Ok(())
}

fn repl(session: &mut Session) -> Result<(), Box<dyn Error>> {
    println!("ThinLisp v{} - incremental reader", env!("CARGO_PKG_VERSION"));
    println!("Type :quit or Ctrl-D to exit, :help for commands");
    println!();

    let mut rl = DefaultEditor::new()?;
    let mut feed = LineFeed::new();
    loop {
        let prompt = if session.reader.is_idle() { "thinlisp> " } else { "      ... " };
        match rl.readline(prompt) {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                if session.reader.is_idle() {
                    if let Some(cmd) = line.trim().strip_prefix(':') {
                        if !session.command(cmd) {
                            break;
                        }
                        continue;
                    }
                }
                feed.push_line(&line);
                if session.drain(&mut feed) {
                    if let Some(missing) = session.missing() {
                        println!("  ; missing: {}", missing);
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                feed.clear();
                session.abandon_input();
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let mut session = Session::new(load_config()?)?;
    match std::env::args().nth(1) {
        Some(path) => run_file(&mut session, &path),
        None => repl(&mut session),
    }
}
