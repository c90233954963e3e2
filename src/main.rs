use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, tick, Receiver, RecvTimeoutError, Sender};
use drs4_daq::settings::{CELLS, GROUPS};
use drs4_daq::*;
use log::{error, info, warn, LevelFilter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simplelog::{ColorChoice, CombinedLogger, TermLogger, TerminalMode, WriteLogger};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    net::TcpStream,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};
use time::OffsetDateTime;

#[derive(Parser, Debug)]
#[command(version, about = "V1742 capture replay and archival")]
struct Cli {
    /// Run configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a raw capture, stream it to the configured sinks and archive it
    Replay { capture: PathBuf },
    /// Write a synthetic capture for the configured card
    Simulate {
        output: PathBuf,
        #[arg(short, long, default_value_t = 1000)]
        events: u32,
        #[arg(long)]
        seed: Option<u64>,
        /// Also write a random correction table here
        #[arg(long)]
        table: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let conf = Conf::read_config_file(&cli.config)?;
    init_logging(&conf)?;
    let settings = Arc::new(CardSettings::from_conf(&conf.card)?);

    match cli.command {
        Command::Replay { capture } => replay(&conf, settings, &capture),
        Command::Simulate {
            output,
            events,
            seed,
            table,
        } => simulate(&settings, &output, events, seed, table.as_deref()),
    }
}

fn init_logging(conf: &Conf) -> Result<()> {
    let log_dir = Path::new(&conf.run_settings.output_dir).join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let now = OffsetDateTime::now_utc();
    let log_file = log_dir.join(format!(
        "{}_{:04}{:02}{:02}T{:02}{:02}{:02}.log",
        conf.card.index,
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    ));
    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            simplelog::Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(
            LevelFilter::Debug,
            simplelog::Config::default(),
            File::create(&log_file)?,
        ),
    ])?;
    Ok(())
}

fn replay(conf: &Conf, settings: Arc<CardSettings>, capture: &Path) -> Result<()> {
    let run = &conf.run_settings;
    if run.batch_size == 0 || run.batch_size > run.event_buffer {
        bail!(
            "batch_size ({}) must be between 1 and event_buffer ({})",
            run.batch_size,
            run.event_buffer
        );
    }
    if run.chunk_bytes == 0 {
        bail!("chunk_bytes must be positive");
    }
    hdf5::filters::blosc_set_nthreads(run.blosc_threads);

    let engine = match &run.calibration_file {
        Some(path) => Some(CalibrationEngine::from_source(
            Arc::clone(&settings),
            &TableFile::new(Path::new(path)),
        )?),
        None => {
            warn!("No calibration table configured, archiving raw samples");
            None
        }
    };
    let writer = ArchiveWriter::new(Arc::clone(&settings), engine);

    let mut sinks = Vec::new();
    for addr in &run.sinks {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                info!("Streaming to {}", addr);
                sinks.push(stream);
            }
            Err(e) => warn!("Could not connect to sink {}: {}", addr, e),
        }
    }
    let pipeline = Pipeline {
        decoder: Decoder::new(Arc::clone(&settings), run.event_buffer),
        dispatcher: Dispatcher::new(Arc::clone(&settings), sinks),
        writer,
        runs: RunFiles::new(Path::new(&run.output_dir), run.campaign_num)?,
        batch_size: run.batch_size,
        pending: Vec::new(),
        counter: Counter::new(),
    };
    info!(
        "Replaying {} as campaign {} run {}",
        capture.to_string_lossy(),
        run.campaign_num,
        pipeline.runs.run_num()
    );

    let (tx_chunks, rx_chunks) = bounded(16);
    let reader_handle = {
        let capture = capture.to_path_buf();
        let chunk_bytes = run.chunk_bytes;
        thread::spawn(move || capture_reading(&capture, chunk_bytes, tx_chunks))
    };

    let processed = event_processing(rx_chunks, pipeline);
    let read = reader_handle
        .join()
        .map_err(|_| anyhow!("Capture reader thread panicked"))?;
    processed?;
    read
}

/// Reads the capture file in chunks and hands them to the processing loop.
fn capture_reading(path: &Path, chunk_bytes: usize, tx: Sender<Vec<u8>>) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Opening capture {:?}", path))?;
    let mut reader = BufReader::new(file);
    loop {
        let mut chunk = vec![0u8; chunk_bytes];
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        chunk.truncate(n);
        if tx.send(chunk).is_err() {
            break;
        }
    }
    Ok(())
}

fn event_processing<W: Write>(rx: Receiver<Vec<u8>>, mut pipeline: Pipeline<W>) -> Result<()> {
    let ticker = tick(Duration::from_secs(1));
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(chunk) => pipeline.feed(&chunk)?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if ticker.try_recv().is_ok() {
            let counter = &pipeline.counter;
            info!(
                "Read {:.2} MB/s ({:.2} MB/s average), {:.1} events/s",
                counter.rate(),
                counter.average_rate(),
                counter.event_rate()
            );
        }
    }
    pipeline.finish()
}

/// Decode, dispatch and archive stages of a replay.
struct Pipeline<W: Write> {
    decoder: Decoder,
    dispatcher: Dispatcher<W>,
    writer: ArchiveWriter,
    runs: RunFiles,
    batch_size: usize,
    pending: Vec<u8>,
    counter: Counter,
}

impl<W: Write> Pipeline<W> {
    /// Decode a chunk in slices no larger than the free buffer space,
    /// dispatching and archiving full batches between slices.
    fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(chunk);
        let mut consumed = 0;
        let mut events = 0;
        loop {
            // a buffer that is full but has no complete batch fails as overflow
            let limit = self.decoder.buffer().free_slots().max(1);
            let report = match self
                .decoder
                .decode_limited(&self.pending[consumed..], limit)
            {
                Ok(report) => report,
                Err(e) => {
                    error!("Decoding stopped: {}", e);
                    let ready = self.decoder.events_ready();
                    self.archive(ready)?;
                    return Err(e.into());
                }
            };
            consumed += report.bytes_consumed;
            events += report.events;

            self.dispatcher.dispatch(self.decoder.buffer_mut())?;
            while self.decoder.events_ready() >= self.batch_size {
                self.archive(self.batch_size)?;
            }
            if report.events < limit {
                break;
            }
        }
        self.pending.drain(..consumed);
        self.counter.increment(chunk.len(), events);
        Ok(())
    }

    /// Archive whatever is left once the capture is exhausted.
    fn finish(mut self) -> Result<()> {
        if !self.pending.is_empty() {
            warn!(
                "{} trailing bytes do not form a complete event",
                self.pending.len()
            );
        }
        let ready = self.decoder.events_ready();
        self.archive(ready)?;
        info!(
            "Replay done: {} events in {} decode passes, {} bytes, last trigger {:?}",
            self.counter.n_events,
            self.decoder.decode_counter(),
            self.counter.total_bytes,
            self.decoder.sequence().last()
        );
        Ok(())
    }

    fn archive(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let path = self.runs.next_file();
        self.writer
            .write_file(&path, self.decoder.buffer_mut(), n)?;
        info!(
            "Wrote {} events to {}{}",
            n,
            path.to_string_lossy(),
            if self.writer.is_calibrating() {
                " (calibrated)"
            } else {
                ""
            }
        );
        Ok(())
    }
}

fn simulate(
    settings: &CardSettings,
    output: &Path,
    events: u32,
    seed: Option<u64>,
    table: Option<&Path>,
) -> Result<()> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let n_samples = settings.num_samples();
    let mut writer = BufWriter::new(File::create(output)?);

    for count in 0..events {
        let groups: Vec<Option<GroupData>> = (0..GROUPS)
            .map(|gr| {
                settings.group_enabled(gr).then(|| GroupData {
                    start_cell: rng.random_range(0..CELLS as u16),
                    samples: std::array::from_fn(|_| synthetic_waveform(&mut rng, n_samples)),
                    tr: settings
                        .tr_readout(gr)
                        .then(|| synthetic_waveform(&mut rng, n_samples)),
                })
            })
            .collect();
        let mut encoder = EventEncoder::new();
        if rng.random_bool(0.05) {
            encoder.pad();
        }
        encoder.event(
            rng.random_range(0..0x8000),
            count,
            count.wrapping_mul(1000),
            &groups,
        );
        writer.write_all(&encoder.to_bytes())?;
    }
    writer.flush()?;
    info!(
        "Wrote {} synthetic events for {} to {}",
        events,
        settings.index(),
        output.to_string_lossy()
    );

    if let Some(path) = table {
        let mut calib = CalibrationTable::default();
        for group in calib.groups.iter_mut() {
            for chan in group.chans.iter_mut() {
                chan.cell_offset
                    .iter_mut()
                    .for_each(|v| *v = rng.random_range(-40..40));
                chan.seq_offset
                    .iter_mut()
                    .for_each(|v| *v = rng.random_range(-8..8));
            }
        }
        let mut file = BufWriter::new(File::create(path)?);
        calib.write_to(&mut file)?;
        file.flush()?;
        info!("Wrote random correction table to {}", path.to_string_lossy());
    }
    Ok(())
}

/// Baseline noise with an occasional negative pulse.
fn synthetic_waveform(rng: &mut StdRng, n_samples: usize) -> Vec<u16> {
    let baseline = rng.random_range(1900..2100);
    let pulse_at = rng.random_bool(0.3).then(|| rng.random_range(0..n_samples));
    (0..n_samples)
        .map(|i| {
            let noise: i32 = rng.random_range(-4..=4);
            let pulse = match pulse_at {
                Some(at) if i >= at => (800.0 * (-((i - at) as f64) / 20.0).exp()) as i32,
                _ => 0,
            };
            (baseline + noise - pulse).clamp(0, 4095) as u16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use drs4_daq::dispatch::{channel_name, encode_record};
    use drs4_daq::settings::CHANNELS;
    use ndarray::Array1;

    // 1656-byte events, so a 1 MiB read holds about 633 of them
    const N_SAMPLES: usize = 136;

    fn settings() -> Arc<CardSettings> {
        let mut mask = [false; CHANNELS];
        mask[0] = true;
        Arc::new(CardSettings::new("V1742_0", N_SAMPLES).with_group(0, mask))
    }

    fn pipeline(output_dir: &Path, event_buffer: usize, batch_size: usize) -> Pipeline<Vec<u8>> {
        let settings = settings();
        Pipeline {
            decoder: Decoder::new(Arc::clone(&settings), event_buffer),
            dispatcher: Dispatcher::new(Arc::clone(&settings), vec![Vec::new()]),
            writer: ArchiveWriter::new(settings, None),
            runs: RunFiles::new(output_dir, 0).unwrap(),
            batch_size,
            pending: Vec::new(),
            counter: Counter::new(),
        }
    }

    fn capture(events: u32) -> Vec<u8> {
        let mut enc = EventEncoder::new();
        for count in 0..events {
            let value = (count % 4096) as u16;
            let group = GroupData {
                start_cell: (count % CELLS as u32) as u16,
                samples: std::array::from_fn(|_| vec![value; N_SAMPLES]),
                tr: None,
            };
            enc.event(0, count, count, &[Some(group)]);
        }
        enc.to_bytes()
    }

    #[test]
    fn test_large_reads_do_not_overflow_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path(), 1000, 500);
        let bytes = capture(4000);
        assert_eq!(bytes.len(), 4000 * 1656);

        for chunk in bytes.chunks(1 << 20) {
            pipeline.feed(chunk).unwrap();
        }
        assert_eq!(pipeline.decoder.event_counter(), 4000);
        assert_eq!(pipeline.decoder.events_ready(), 0);
        assert!(pipeline.pending.is_empty());
        assert_eq!(pipeline.counter.n_events, 4000);

        let mut record = Vec::new();
        let samples = Array1::<u16>::zeros(N_SAMPLES);
        encode_record(&mut record, 0, samples.view(), &channel_name("V1742_0", 0, 0)).unwrap();
        assert_eq!(
            pipeline.dispatcher.sinks()[0].len(),
            4000 * record.len()
        );

        let camp = dir.path().join("camp0");
        for part in 0..8 {
            let file = hdf5::File::open(camp.join(format!("run0_{}.h5", part))).unwrap();
            let counts = file
                .dataset("V1742_0/gr0/trigger_count")
                .unwrap()
                .read_1d::<u32>()
                .unwrap();
            assert_eq!(counts.len(), 500);
            assert_eq!(counts[0], part * 500);
        }
        assert!(!camp.join("run0_8.h5").exists());
        pipeline.finish().unwrap();
        assert!(!camp.join("run0_8.h5").exists());
    }

    #[test]
    fn test_split_event_carried_to_next_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path(), 4, 3);
        let bytes = capture(5);

        pipeline.feed(&bytes[..2000]).unwrap();
        assert_eq!(pipeline.decoder.event_counter(), 1);
        assert_eq!(pipeline.pending.len(), 2000 - 1656);

        pipeline.feed(&bytes[2000..]).unwrap();
        assert_eq!(pipeline.decoder.event_counter(), 5);
        assert_eq!(pipeline.decoder.events_ready(), 2);
        assert!(dir.path().join("camp0").join("run0_0.h5").exists());

        pipeline.finish().unwrap();
        let file = hdf5::File::open(dir.path().join("camp0").join("run0_1.h5")).unwrap();
        let cells = file
            .dataset("V1742_0/gr0/start_index")
            .unwrap()
            .read_1d::<u16>()
            .unwrap();
        assert_eq!(cells.to_vec(), vec![3, 4]);
    }

    #[test]
    fn test_decode_error_archives_ready_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path(), 8, 8);
        let mut bytes = capture(2);
        bytes.extend_from_slice(&0xB000_0004u32.to_le_bytes());

        assert!(pipeline.feed(&bytes).is_err());
        assert_eq!(pipeline.decoder.events_ready(), 0);
        assert!(dir.path().join("camp0").join("run0_0.h5").exists());
    }
}
