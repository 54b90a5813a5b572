mod fs;

use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use eyre_pretty::{Context, ContextCompat, Result, bail};
use nanorand::Rng;
use quartz::{
    Config, Console,
    modules::{Modules, TracingDebugModule},
    queue::QueueError,
    system::{CPU_FREQUENCY, CYCLES_PER_TICK, cart::CART_BASE},
    ucode::accum::Accum,
};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

#[derive(Debug, Subcommand)]
enum Command {
    /// Enqueue random commands and check the coprocessor's result.
    Stress {
        /// How many commands to enqueue
        #[arg(short, long, default_value_t = 100_000)]
        commands: u32,
        /// Capacity of the command ring, in words
        #[arg(short, long, default_value_t = 1024)]
        ring_words: u32,
    },
    /// Record a block and replay it.
    Blocks {
        /// How many commands the block holds
        #[arg(short, long, default_value_t = 64)]
        commands: u32,
        /// How many times to replay the block
        #[arg(short, long, default_value_t = 100)]
        replays: u32,
    },
    /// Copy from the cartridge to RAM and report the timing.
    Dma {
        /// Bytes to copy
        #[arg(short, long, default_value_t = 256 * 1024)]
        size: u32,
        /// Cartridge image to copy from (random data if missing)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Run periodic and one-shot timers for a while.
    Timers {
        /// Periods of the periodic timers, in ticks
        #[arg(short, long, default_values_t = [100, 250, 1000])]
        periods: Vec<u64>,
        /// How long to run for, in ticks
        #[arg(short, long, default_value_t = 10_000)]
        ticks: u64,
    },
    /// Make the coprocessor raise an assertion and print the crash report.
    Crash {
        /// Assertion code (20 bits)
        #[arg(short, long, default_value_t = 0x1234)]
        code: u32,
    },
    /// Mount an archive and list or print its entries.
    Fs {
        /// Path to the archive
        #[arg(short, long)]
        input: PathBuf,
        /// Entry to print to stdout (lists every entry if missing)
        #[arg(short, long)]
        cat: Option<String>,
    },
    /// Build an archive out of files.
    Pack {
        /// Path to the output archive
        #[arg(short, long)]
        output: PathBuf,
        /// Files to add. Entries are named after their path relative to `root`.
        files: Vec<PathBuf>,
        /// Directory entry names are relative to
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },
}

/// A CLI to exercise the quartz command queue and DMA runtime.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Action to take
    #[command(subcommand)]
    command: Command,
}

fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or(EnvFilter::new("quartz=info,quartztool=info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();
}

fn console(cartridge: Vec<u8>, ring_words: u32) -> Result<Console> {
    let mut console = Console::new(
        Modules {
            debug: Box::new(TracingDebugModule),
        },
        Config {
            cartridge,
            ring_words,
            ..Default::default()
        },
    )
    .context("creating console")?;

    console.switch_microcode(Accum::default().microcode())?;
    Ok(console)
}

fn seconds(cycles: u64) -> f64 {
    cycles as f64 / CPU_FREQUENCY as f64
}

fn stress(commands: u32, ring_words: u32) -> Result<()> {
    let accum = Accum::default();
    let mut console = console(Vec::new(), ring_words)?;
    let mut rng = nanorand::tls_rng();

    let mut expected = 0u64;
    for i in 0..commands {
        if rng.generate_range(0..4u32) == 0 {
            let count = rng.generate_range(1..16usize);
            let values = (0..count)
                .map(|_| rng.generate::<u32>())
                .collect::<Vec<_>>();
            console.enqueue(accum.add_many(&values)?)?;
            expected += values.iter().map(|v| *v as u64).sum::<u64>();
        } else {
            let value = rng.generate_range(0..0x10_0000u32);
            console.enqueue(accum.add(value))?;
            expected += value as u64;
        }

        if i % 1000 == 999 {
            console.sync()?;
        }
    }

    console.sync()?;
    let sum = Accum::sum(&console);
    println!("sum: {sum} (expected {expected})");
    println!(
        "ring wrapped {} times, {} cycles ({:.3}s emulated)",
        console.ring_wraps(),
        console.elapsed(),
        seconds(console.elapsed())
    );

    if sum != expected {
        bail!("coprocessor sum does not match");
    }

    Ok(())
}

fn blocks(commands: u32, replays: u32) -> Result<()> {
    let accum = Accum::default();
    let mut console = console(Vec::new(), 1024)?;

    console.begin_block()?;
    for i in 0..commands {
        console.enqueue(accum.add(i))?;
    }
    let block = console.end_block()?;
    println!(
        "recorded {} words at {} (depth {})",
        block.words(),
        block.addr(),
        block.depth()
    );

    let start = console.elapsed();
    for _ in 0..replays {
        console.run_block(&block)?;
    }
    console.sync()?;
    let cycles = console.elapsed() - start;

    console.free_block(block)?;
    console.sync()?;

    let expected = (0..commands as u64).sum::<u64>() * replays as u64;
    let sum = Accum::sum(&console);
    println!("sum: {sum} (expected {expected}), {cycles} cycles for {replays} replays");

    if sum != expected {
        bail!("block replay sum does not match");
    }

    Ok(())
}

fn dma(size: u32, input: Option<PathBuf>) -> Result<()> {
    let cartridge = match input {
        Some(path) => std::fs::read(&path).context("reading cartridge image")?,
        None => {
            let mut rng = nanorand::tls_rng();
            (0..size).map(|_| rng.generate::<u8>()).collect()
        }
    };

    let size = size.min(cartridge.len() as u32) & !1;
    if size == 0 {
        bail!("nothing to copy");
    }

    let mut console = console(cartridge, 1024)?;
    let buffer = console.alloc(size).context("allocating RAM for the copy")?;

    let start = console.elapsed();
    console.dma_read(buffer, CART_BASE, size)?;
    let cycles = console.elapsed() - start;

    let copied = console.ram(buffer.span(size)).context("reading back RAM")?;
    if copied != &console.system.cart.data()[..size as usize] {
        bail!("RAM does not match the cartridge");
    }

    let secs = seconds(cycles);
    println!(
        "copied {} in {cycles} cycles ({:.3}ms, {}/s)",
        ByteSize::b(size as u64),
        secs * 1000.0,
        ByteSize::b((size as f64 / secs) as u64)
    );

    Ok(())
}

fn timers(periods: Vec<u64>, ticks: u64) -> Result<()> {
    let mut console = console(Vec::new(), 1024)?;
    let counts = Arc::new(Mutex::new(vec![0u64; periods.len()]));

    for (index, period) in periods.iter().copied().enumerate() {
        if period == 0 {
            bail!("timer periods must be at least one tick");
        }

        let counts = counts.clone();
        console.new_timer(period, period, move |_, _| counts.lock().unwrap()[index] += 1);
    }

    let one_shot = Arc::new(Mutex::new(None));
    console.new_timer(ticks / 2, 0, {
        let one_shot = one_shot.clone();
        move |console, tick| {
            *one_shot.lock().unwrap() = Some((tick.deadline, console.timer_ticks()));
        }
    });

    console.run_for(ticks * CYCLES_PER_TICK);

    for (period, count) in periods.iter().zip(counts.lock().unwrap().iter()) {
        println!("every {period} ticks: fired {count} times (expected {})", ticks / period);
    }

    match *one_shot.lock().unwrap() {
        Some((deadline, fired)) => println!("one-shot due at {deadline} fired at {fired}"),
        None => bail!("one-shot timer never fired"),
    }

    Ok(())
}

fn crash(code: u32) -> Result<()> {
    let accum = Accum::default();
    let mut console = console(Vec::new(), 1024)?;

    console.enqueue(accum.add(7))?;
    console.enqueue(accum.assert(code))?;

    match console.sync() {
        Err(QueueError::Crashed(report)) => {
            println!("{report}");
            Ok(())
        }
        Err(e) => Err(e.into()),
        Ok(()) => bail!("coprocessor did not crash"),
    }
}

fn main() -> Result<()> {
    eyre_pretty::install()?;
    setup_tracing();

    let config = Args::parse();
    match config.command {
        Command::Stress {
            commands,
            ring_words,
        } => stress(commands, ring_words),
        Command::Blocks { commands, replays } => blocks(commands, replays),
        Command::Dma { size, input } => dma(size, input),
        Command::Timers { periods, ticks } => timers(periods, ticks),
        Command::Crash { code } => crash(code),
        Command::Fs { input, cat } => fs::inspect(input, cat),
        Command::Pack {
            output,
            files,
            root,
        } => fs::pack(output, files, root),
    }
}
