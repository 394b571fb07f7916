//! Overture command-line decoder.

mod ivf;
mod mux;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use overture_av1::{Decoder, DecoderConfig};

#[derive(Parser, Debug)]
#[command(name = "overture", version, about = "AV1 decoder")]
struct Args {
    /// Input file
    #[arg(short, long)]
    input: PathBuf,

    /// Output file
    #[arg(short, long)]
    output: PathBuf,

    /// Force muxer type (default: detect from extension)
    #[arg(long)]
    muxer: Option<String>,

    /// Stop decoding after this many frames
    #[arg(short, long)]
    limit: Option<u64>,

    /// Skip decoding of the first frames
    #[arg(short, long, default_value_t = 0)]
    skip: u64,

    /// Number of frame threads
    #[arg(long, default_value_t = 1)]
    framethreads: usize,

    /// Number of tile threads
    #[arg(long, default_value_t = 1)]
    tilethreads: usize,

    /// Disable status messages
    #[arg(short, long)]
    quiet: bool,
}

fn muxer_for(args: &Args) -> Option<Box<dyn mux::Muxer>> {
    let sink: Box<dyn Write> = if args.output == Path::new("-") {
        Box::new(io::stdout().lock())
    } else {
        match File::create(&args.output) {
            Ok(f) => Box::new(BufWriter::new(f)),
            Err(e) => {
                eprintln!("Error creating {}: {e}", args.output.display());
                return None;
            }
        }
    };
    let name = args.muxer.clone().unwrap_or_else(|| {
        args.output
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "yuv".to_string())
    });
    mux::by_name(&name, sink)
}

fn run(args: &Args) -> Result<u64, String> {
    let file = File::open(&args.input)
        .map_err(|e| format!("Error opening {}: {e}", args.input.display()))?;
    let mut demuxer =
        ivf::IvfReader::new(BufReader::new(file)).map_err(|e| format!("Invalid input: {e}"))?;
    let mut muxer = muxer_for(args).ok_or_else(|| "Unknown muxer".to_string())?;

    let mut decoder = Decoder::new(DecoderConfig {
        n_frame_threads: args.framethreads.max(1),
        n_tile_threads: args.tilethreads.max(1),
        allocator: None,
    });

    let progress = if args.quiet {
        None
    } else {
        let bar = ProgressBar::new(demuxer.header.frame_count as u64);
        bar.set_style(
            ProgressStyle::with_template("{pos}/{len} frames {per_sec} {elapsed}")
                .expect("static template"),
        );
        Some(bar)
    };

    let start = Instant::now();
    let mut emitted = 0u64;
    let mut seen = 0u64;
    let mut output = |pictures: Vec<overture_av1::Picture>,
                      muxer: &mut Box<dyn mux::Muxer>|
     -> Result<bool, String> {
        for picture in pictures {
            seen += 1;
            if seen <= args.skip {
                continue;
            }
            muxer
                .write_picture(&picture)
                .map_err(|e| format!("Error writing output: {e}"))?;
            emitted += 1;
            if let Some(bar) = &progress {
                bar.inc(1);
            }
            if let Some(limit) = args.limit {
                if emitted >= limit {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    };

    let mut done = false;
    while let Some((_pts, data)) = demuxer
        .read_frame()
        .map_err(|e| format!("Error reading input: {e}"))?
    {
        match decoder.decode(&data) {
            Ok(pictures) => done = output(pictures, &mut muxer)?,
            Err(e) => {
                // a frame-local error drops that frame; the stream goes on
                if e.is_frame_local() {
                    info!("frame dropped: {e}");
                } else {
                    return Err(format!("Decode error: {e}"));
                }
            }
        }
        if done {
            break;
        }
    }
    if !done {
        output(decoder.finish(), &mut muxer)?;
    }
    muxer
        .finish()
        .map_err(|e| format!("Error finalizing output: {e}"))?;

    if let Some(bar) = &progress {
        bar.finish_and_clear();
    }
    if !args.quiet {
        let elapsed = start.elapsed().as_secs_f64();
        eprintln!(
            "Decoded {emitted} frames in {elapsed:.2}s ({:.2} fps)",
            emitted as f64 / elapsed.max(1e-9)
        );
    }
    Ok(emitted)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(_) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}
