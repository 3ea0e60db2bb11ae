//! RV32 user-mode emulator with a block-threaded execution engine.
//!
//! Instruction words decode into operation records that are grouped into
//! basic blocks, cached with hot-block promotion, pre-linked to their
//! static successors, and dispatched by tail chaining; indirect branch
//! targets resolve through per-instruction branch-history tables. The host
//! supplies memory and the environment through the [`io::Bus`] facade and
//! drives execution via [`Engine::run`].
//!
//! ```no_run
//! use threadrv::{Config, Engine, FlatMemory};
//!
//! let mut mem = FlatMemory::new(0, 64 * 1024);
//! mem.load(0, &program_image());
//! let mut engine = Engine::new(mem, Config::default());
//! engine.cpu.pc = 0;
//! engine.run(u64::MAX).unwrap();
//! # fn program_image() -> Vec<u8> { Vec::new() }
//! ```

pub mod config;
pub mod cpu;
pub mod engine;
pub mod io;
pub mod jit;
pub mod snapshot;

pub use config::Config;
pub use cpu::{Cpu, Trap};
pub use engine::{Engine, EngineError, Stats};
pub use io::{Bus, FlatMemory};
