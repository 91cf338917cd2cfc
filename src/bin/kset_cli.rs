//! Command-line driver for KIII networks.
//!
//! Examples:
//!   kset-cli init --save net.img
//!   kset-cli --seed 7 run patterns.json
//!   kset-cli --parallel train patterns.json --load net.img --save net.img
//!   kset-cli inspect net.img
//!
//! Patterns are a JSON array of arrays, one inner array per pattern. Feature
//! vectors are printed to stdout as JSON; logs go to stderr.

use std::path::{Path, PathBuf};
use std::process;

use ksets::observer::NetworkAdapter;
use ksets::prelude::*;

struct Options {
    config: Option<PathBuf>,
    mode: ExecutionMode,
    seed: Option<u64>,
    load: Option<PathBuf>,
    save: Option<PathBuf>,
    args: Vec<String>,
}

fn usage() -> ! {
    eprintln!("kset-cli: drive a Freeman KIII oscillator network");
    eprintln!("Usage: kset-cli [--config cfg.json] [--parallel] [--seed N] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  init [--save image]                      Warm up a new network, print its features");
    eprintln!("  run <patterns.json> [--load image] [--save image]");
    eprintln!("                                           Print one feature vector per pattern");
    eprintln!("  train <patterns.json> --save image [--load image]");
    eprintln!("                                           Train the configured layer, save the result");
    eprintln!("  inspect <image>                          Print a snapshot of a saved network");
    process::exit(1);
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    process::exit(1);
}

fn parse_args() -> Options {
    let mut opts = Options {
        config: None,
        mode: ExecutionMode::Sequential,
        seed: None,
        load: None,
        save: None,
        args: Vec::new(),
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => opts.config = Some(it.next().unwrap_or_else(|| usage()).into()),
            "--parallel" => opts.mode = ExecutionMode::Parallel,
            "--seed" => {
                let raw = it.next().unwrap_or_else(|| usage());
                let seed = raw
                    .parse()
                    .unwrap_or_else(|_| fail("seed must be an unsigned integer"));
                opts.seed = Some(seed);
            }
            "--load" => opts.load = Some(it.next().unwrap_or_else(|| usage()).into()),
            "--save" => opts.save = Some(it.next().unwrap_or_else(|| usage()).into()),
            "-h" | "--help" => usage(),
            _ => opts.args.push(arg),
        }
    }

    if opts.args.is_empty() {
        usage();
    }
    opts
}

fn load_config(opts: &Options) -> Result<KsetConfig> {
    let mut cfg = match &opts.config {
        Some(path) => KsetConfig::from_json_file(path)?,
        None => KsetConfig::default(),
    };
    if let Some(seed) = opts.seed {
        cfg = cfg.with_seed(seed);
    }
    cfg.validate()?;
    Ok(cfg)
}

fn load_patterns(path: &Path) -> Result<Vec<Vec<f64>>> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| KsetError::Config(format!("invalid patterns file {}: {e}", path.display())))
}

// An image carries its own config and PRNG state.
fn check_load_flags(opts: &Options) -> Result<()> {
    if opts.load.is_some() && (opts.config.is_some() || opts.seed.is_some()) {
        return Err(KsetError::Config(
            "--config and --seed cannot be combined with --load".to_string(),
        ));
    }
    Ok(())
}

// A loaded image is used as-is; a fresh network is warmed up first.
fn open_network(opts: &Options) -> Result<Network> {
    check_load_flags(opts)?;
    match &opts.load {
        Some(path) => Network::load(path),
        None => {
            let mut net = Network::new(load_config(opts)?)?;
            net.initialize_in(opts.mode)?;
            Ok(net)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{s}"),
        Err(e) => fail(e),
    }
}

fn run(opts: &Options) -> Result<()> {
    let cmd = opts.args[0].as_str();
    match cmd {
        "init" => {
            let mut net = Network::new(load_config(opts)?)?;
            let features = net.initialize_in(opts.mode)?;
            print_json(&features);
            if let Some(path) = &opts.save {
                net.save(path)?;
            }
        }
        "run" => {
            let Some(patterns) = opts.args.get(1) else { usage() };
            let patterns = load_patterns(Path::new(patterns))?;
            let mut net = open_network(opts)?;
            let features = net.run_in(opts.mode, &patterns)?;
            print_json(&features);
            if let Some(path) = &opts.save {
                net.save(path)?;
            }
        }
        "train" => {
            let Some(patterns) = opts.args.get(1) else { usage() };
            let Some(save) = &opts.save else {
                fail("train needs --save <image>")
            };
            let patterns = load_patterns(Path::new(patterns))?;
            let mut net = open_network(opts)?;
            let rule = Hebbian::new(net.config().hebbian);
            net.train_in(opts.mode, &patterns, &rule)?;
            net.save(save)?;
        }
        "inspect" => {
            let Some(image) = opts.args.get(1) else { usage() };
            let net = Network::load(image)?;
            let snapshot = NetworkAdapter::new(&net).snapshot();
            print_json(&snapshot);
            eprintln!("image size: {} bytes", net.image_size_bytes()?);
        }
        _ => usage(),
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let opts = parse_args();
    if let Err(e) = run(&opts) {
        fail(e);
    }
}
