use indicatif::ProgressBar;
use nanorand::Rng;
use quartz::{
    Config, Console,
    modules::Modules,
    queue::Block,
    system::cart::CART_BASE,
    ucode::accum::Accum,
};

const ROUNDS: u64 = 20_000;

/// Random mix of direct commands, block replays, syncpoint waits and bus DMA, with a periodic
/// timer running underneath. Checks the coprocessor's sum against the expected one.
fn stress_queue(ring_words: u32) {
    println!("=> stressing queue with a ring of {ring_words} words");

    let accum = Accum::default();
    let mut rng = nanorand::tls_rng();
    let cartridge = (0..64 * 1024u32).map(|i| i as u8).collect::<Vec<_>>();
    let mut console = Console::new(
        Modules::default(),
        Config {
            cartridge: cartridge.clone(),
            ring_words,
            poll_cycles: 64,
        },
    )
    .unwrap();
    console.switch_microcode(accum.microcode()).unwrap();

    let ticks = std::sync::Arc::new(std::sync::Mutex::new(0u64));
    console.new_timer(100, 100, {
        let ticks = ticks.clone();
        move |_, _| *ticks.lock().unwrap() += 1
    });

    let buffer = console.alloc(4096).unwrap();
    let mut blocks: Vec<(Block, u64)> = Vec::new();
    let mut expected = 0u64;

    let bar = ProgressBar::new(ROUNDS);
    for _ in 0..ROUNDS {
        match rng.generate_range(0..100u32) {
            0..60 => {
                let value = rng.generate_range(0..1000u32);
                console.enqueue(accum.add(value)).unwrap();
                expected += value as u64;
            }
            60..70 => {
                let count = rng.generate_range(1..16usize);
                let values = (0..count)
                    .map(|_| rng.generate_range(0..1000u32))
                    .collect::<Vec<_>>();
                console.enqueue(accum.add_many(&values).unwrap()).unwrap();
                expected += values.iter().map(|v| *v as u64).sum::<u64>();
            }
            70..75 if blocks.len() < 8 => {
                console.begin_block().unwrap();
                let mut sum = 0;
                for _ in 0..rng.generate_range(1..20u32) {
                    let value = rng.generate_range(0..100u32);
                    console.enqueue(accum.add(value)).unwrap();
                    sum += value as u64;
                }
                blocks.push((console.end_block().unwrap(), sum));
            }
            75..85 if !blocks.is_empty() => {
                let index = rng.generate_range(0..blocks.len());
                let (block, sum) = &blocks[index];
                console.run_block(block).unwrap();
                expected += sum;
            }
            85..87 if !blocks.is_empty() => {
                let index = rng.generate_range(0..blocks.len());
                let (block, _) = blocks.swap_remove(index);
                console.free_block(block).unwrap();
            }
            87..90 => {
                console.sync().unwrap();
                assert_eq!(Accum::sum(&console), expected);
            }
            90..95 => {
                if !console.dma_busy() {
                    let offset = rng.generate_range(0..60u32) * 1024;
                    console
                        .dma_read_async(buffer, CART_BASE + offset, 4096)
                        .unwrap();
                }
            }
            _ => console.poll(),
        }

        bar.inc(1);
    }
    bar.finish();

    console.sync().unwrap();
    console.dma_wait();
    assert_eq!(Accum::sum(&console), expected);
    assert!(*ticks.lock().unwrap() > 0);

    for (block, _) in blocks {
        console.free_block(block).unwrap();
    }

    println!(
        "   {} commands, {} wraps, {} timer ticks",
        console.system.sp.executed,
        console.ring_wraps(),
        ticks.lock().unwrap()
    );
    console.close().unwrap();
}

fn main() {
    stress_queue(64);
    stress_queue(1024);
    stress_queue(16 * 1024);
}
