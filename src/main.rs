use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dwelltrack::clock::Clock;
use dwelltrack::outbox::{spawn_dispatcher, JsonLinesSink, Outbox};
use dwelltrack::pipeline::Pipeline;
use dwelltrack::{Config, Frame};

/// Replays recorded detections through the tracker and writes one anonymous
/// session payload per line.
#[derive(Parser, Debug)]
#[command(name = "dwelltrack", version)]
struct Args {
    /// JSON config file; missing keys take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frames as JSON lines, `-` for stdin
    #[arg(long, default_value = "-")]
    input: String,

    /// Payload destination, `-` for stdout
    #[arg(long, default_value = "-")]
    output: String,

    /// Timestamp frames with the wall clock instead of index / fps
    #[arg(long)]
    live: bool,

    #[arg(long)]
    device_id: Option<u32>,

    #[arg(long)]
    fps: Option<f64>,

    #[arg(long)]
    max_age: Option<u32>,

    #[arg(long)]
    min_hits: Option<u32>,

    #[arg(long)]
    iou_threshold: Option<f32>,

    #[arg(long)]
    session_timeout: Option<f64>,
}

impl Args {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(v) = self.device_id {
            config.device_id = v;
        }
        if let Some(v) = self.fps {
            config.fps = v;
        }
        if let Some(v) = self.max_age {
            config.max_age = v;
        }
        if let Some(v) = self.min_hits {
            config.min_hits = v;
        }
        if let Some(v) = self.iou_threshold {
            config.iou_threshold = v;
        }
        if let Some(v) = self.session_timeout {
            config.session_timeout_seconds = v;
        }

        config.validate()?;
        Ok(config)
    }

    fn reader(&self) -> Result<Box<dyn BufRead + Send>> {
        Ok(if self.input == "-" {
            Box::new(BufReader::new(io::stdin()))
        } else {
            let file = File::open(&self.input).with_context(|| format!("opening {}", self.input))?;
            Box::new(BufReader::new(file))
        })
    }

    fn writer(&self) -> Result<Box<dyn Write + Send>> {
        Ok(if self.output == "-" {
            Box::new(io::stdout())
        } else {
            let file =
                File::create(&self.output).with_context(|| format!("creating {}", self.output))?;
            Box::new(BufWriter::new(file))
        })
    }
}

// how often an idle intake rechecks the interrupt flag
const INTAKE_POLL: Duration = Duration::from_millis(100);

/// Input lines, read on their own thread so an interrupt is noticed even
/// while the source has nothing to say.
struct Intake {
    lines: Receiver<io::Result<String>>,
}

impl Intake {
    fn spawn(reader: Box<dyn BufRead + Send>) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(64);

        thread::Builder::new()
            .name("intake".into())
            .spawn(move || {
                for line in reader.lines() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                debug!("intake: end of input");
            })
            .context("spawning intake thread")?;

        Ok(Self { lines: rx })
    }

    /// Next line; `None` at end of input or once `stop` is raised.
    fn next(&self, stop: &AtomicBool) -> Option<io::Result<String>> {
        loop {
            if stop.load(Ordering::Relaxed) {
                return None;
            }

            match self.lines.recv_timeout(INTAKE_POLL) {
                Ok(line) => return Some(line),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.config()?;
    info!("{:?}", config);

    let interrupted = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&interrupted))
            .context("installing signal handler")?;
    }

    let outbox = Outbox::with_capacity(config.outbox_capacity);
    let sender = spawn_dispatcher(outbox.clone(), JsonLinesSink::new(args.writer()?))?;

    let clock = if args.live {
        Clock::Wall
    } else {
        Clock::stream(config.fps, config.stream_epoch)
    };
    let mut pipeline = Pipeline::from_config(&config, clock, outbox.clone());

    // a blocked read is left behind on interrupt; the process exits anyway
    let intake = Intake::spawn(args.reader()?)?;
    let mut lineno = 0;

    while let Some(line) = intake.next(&interrupted) {
        lineno += 1;

        let line = line.context("reading input")?;
        if line.trim().is_empty() {
            continue;
        }

        match Frame::from_json(&line) {
            Ok(frame) => {
                pipeline.process(&frame);
            }
            Err(err) => warn!("line {}: {}, skipped", lineno, err),
        }
    }

    if interrupted.load(Ordering::Relaxed) {
        pipeline.shutdown();
    } else {
        pipeline.finish();
    }

    outbox.close();
    let stats = sender
        .join()
        .map_err(|_| anyhow::anyhow!("payload sender panicked"))?;

    info!(
        "done: {} payloads sent, {} failed, {} lost",
        stats.sent,
        stats.failed,
        outbox.lost()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Instant;

    #[test]
    fn intake_yields_every_line_then_ends() {
        let input = Cursor::new(b"{\"index\": 0}\n\n{\"index\": 1}\n".to_vec());
        let intake = Intake::spawn(Box::new(input)).unwrap();
        let stop = AtomicBool::new(false);

        let mut lines = Vec::new();
        while let Some(line) = intake.next(&stop) {
            lines.push(line.unwrap());
        }

        assert_eq!(lines, vec!["{\"index\": 0}", "", "{\"index\": 1}"]);
    }

    #[test]
    fn interrupt_stops_an_idle_intake() {
        // the sender stays alive and silent, like a live pipe with no traffic
        let (_tx, rx) = crossbeam_channel::bounded(1);
        let intake = Intake { lines: rx };
        let stop = Arc::new(AtomicBool::new(false));

        let raise = Arc::clone(&stop);
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            raise.store(true, Ordering::Relaxed);
        });

        let started = Instant::now();
        assert!(intake.next(&stop).is_none());
        assert!(started.elapsed() < Duration::from_secs(5));

        raiser.join().unwrap();
    }
}
