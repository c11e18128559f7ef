use clap::Parser as ClapParser;
use std::process;

use heap::HeapSettings;
use vm::{Machine, MachineOptions, MachineError};

/// Exit code reserved for a program killed by an uncaught exception.
const UNCAUGHT_EXIT: i32 = 101;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Assembly image to execute
    image: String,

    /// Entry function name
    #[arg(long, default_value = "main")]
    entry: String,

    /// Heap reservation size in bytes
    #[arg(long)]
    heap_size: Option<usize>,

    /// Arena size in bytes
    #[arg(long)]
    arena_size: Option<usize>,

    /// Print collection statistics on exit
    #[arg(long)]
    gc_stats: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let assembly = match vm::load_assembly(cli.image.as_ref()) {
        Ok(assembly) => assembly,
        Err(err) => {
            eprintln!("error loading '{}': {}", cli.image, err);
            process::exit(1);
        }
    };

    let entry = match assembly.function_by_name(&cli.entry) {
        Some(entry) => entry,
        None => {
            eprintln!(
                "error: no function named `{}` in '{}'",
                cli.entry, cli.image
            );
            process::exit(1);
        }
    };

    let mut heap = HeapSettings::default();
    if let Some(size) = cli.heap_size {
        heap.heap_size = size;
    }
    if let Some(size) = cli.arena_size {
        heap.arena_size = size;
    }

    let machine = Machine::new(assembly, MachineOptions {
        heap,
        ..MachineOptions::default()
    });

    let result = machine.run(entry, Vec::new());

    if cli.gc_stats {
        let counters = machine.heap().counters();
        use std::sync::atomic::Ordering::Relaxed;
        eprintln!(
            "gc: {} objects / {} bytes allocated, {} collections, {} bytes reclaimed",
            counters.objects_allocated.load(Relaxed),
            counters.bytes_allocated.load(Relaxed),
            counters.collections.load(Relaxed),
            counters.bytes_reclaimed.load(Relaxed),
        );
    }

    match result {
        Ok(code) => process::exit(code),
        Err(MachineError::UncaughtException(exc)) => {
            eprintln!("unhandled exception: {exc}");
            process::exit(UNCAUGHT_EXIT);
        }
        Err(MachineError::Fatal(err)) => {
            eprintln!("fatal: {err}");
            process::exit(1);
        }
    }
}
