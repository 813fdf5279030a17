//! ND-100 Emulator - CLI Entry Point
//!
//! Commands:
//! - `nd100-emu run <image>` - Load a raw word image and run it
//! - `nd100-emu config` - Print the default machine configuration

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nd100-emu")]
#[command(author = "Yigit")]
#[command(version = "0.1.0")]
#[command(about = "An emulator of the Norsk Data ND-100 CPU and memory management unit")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program image until it stops
    Run {
        /// Raw image of big-endian 16-bit words
        image: String,
        /// JSON machine configuration
        #[arg(short, long)]
        config: Option<String>,
        /// Physical load address (decimal, 0o octal or 0x hex)
        #[arg(short, long, value_parser = parse_number)]
        load_address: Option<u32>,
        /// Initial program counter, at most 0o177777
        #[arg(short, long, value_parser = parse_word)]
        start: Option<u16>,
        /// Maximum number of instructions to run
        #[arg(short, long)]
        max_steps: Option<u64>,
        /// Show trace output
        #[arg(short, long)]
        trace: bool,
    },
    /// Print the default configuration as JSON
    Config,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run {
            image,
            config,
            load_address,
            start,
            max_steps,
            trace,
        }) => {
            let mut config = load_config(config.as_deref());
            if let Some(addr) = load_address {
                config.load_address = addr;
            }
            if let Some(addr) = start {
                config.start_address = addr;
            }
            if let Some(steps) = max_steps {
                config.max_steps = steps;
            }
            run_image(&image, &config, trace);
        }
        Some(Commands::Config) => match nd100::Config::default().to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("❌ {}", e);
                std::process::exit(1);
            }
        },
        None => {
            println!("ND-100 Emulator v0.1.0");
            println!("A Norsk Data ND-100 CPU emulator");
            println!();
            println!("Use --help for available commands");
        }
    }
}

fn parse_number(s: &str) -> Result<u32, String> {
    let parsed = if let Some(oct) = s.strip_prefix("0o") {
        u32::from_str_radix(oct, 8)
    } else if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_word(s: &str) -> Result<u16, String> {
    let value = parse_number(s)?;
    u16::try_from(value).map_err(|_| format!("{} does not fit in a 16-bit address", s))
}

fn load_config(path: Option<&str>) -> nd100::Config {
    let config = match path {
        Some(path) => nd100::Config::load(path),
        None => Ok(nd100::Config::default()),
    };
    match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    }
}

fn load_image(path: &str) -> Vec<u16> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("❌ Failed to read file: {}", e);
            std::process::exit(1);
        }
    };
    if bytes.len() % 2 != 0 {
        eprintln!("⚠️  Odd image length, ignoring the last byte");
    }
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

fn run_image(path: &str, config: &nd100::Config, trace: bool) {
    use nd100::{Cpu, StepOutcome};

    if let Err(e) = config.validate() {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }

    println!("🔧 Running: {}", path);
    let words = load_image(path);
    if words.is_empty() {
        eprintln!("❌ No words to execute");
        std::process::exit(1);
    }

    let mut cpu = Cpu::with_config(config);
    if let Err(e) = cpu.load_program(config.load_address, &words) {
        eprintln!("❌ Failed to load image: {}", e);
        std::process::exit(1);
    }
    println!("📂 Loaded {} words at {:06o}", words.len(), config.load_address);

    println!();
    println!("━━━ Execution ━━━");

    let mut steps = 0u64;
    let mut stop = None;
    while steps < config.max_steps {
        let level = cpu.regs.level();
        let p = cpu.regs.p();
        match cpu.step() {
            Ok(outcome) => {
                if trace {
                    match outcome {
                        StepOutcome::Executed(instr) => {
                            println!(
                                "{:02} {:06o}: {:?}  A={:06o} T={:06o} X={:06o}",
                                level,
                                p,
                                instr,
                                cpu.regs.a(),
                                cpu.regs.t(),
                                cpu.regs.x()
                            );
                        }
                        StepOutcome::Trapped(trap) => {
                            println!("{:02} {:06o}: trap {:?}", level, p, trap);
                        }
                    }
                }
                steps += 1;
            }
            Err(reason) => {
                stop = Some(reason);
                break;
            }
        }
    }

    println!();
    println!("━━━ Result ━━━");
    println!("Steps: {}", steps);
    match stop {
        Some(reason) => println!("Stopped: {}", reason),
        None => {
            println!(
                "⚠️  Reached max steps limit ({}). Use --max-steps to increase.",
                config.max_steps
            );
        }
    }
    print!("{:?}", cpu);
}
