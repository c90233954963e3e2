use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error};
use ndarray::ArrayView1;
use std::io::{self, Write};
use std::sync::Arc;

use crate::buffer::EventBuffer;
use crate::error::DispatchError;
use crate::settings::{CardSettings, CHANNELS};

/// Bytes per sample on the stream.
pub const SAMPLE_WIDTH: u8 = 2;
// pattern, sample width, sample count, name length
const FIXED_BYTES: usize = 1 + 1 + 2 + 2;

/// Outcome of one dispatch pass.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub events: usize,
    pub records: usize,
    /// Sinks that failed during the pass, with the error that took them out.
    pub failed_sinks: Vec<(usize, io::Error)>,
}

/// Stream name of one waveform.
pub fn channel_name(card: &str, gr: usize, ch: usize) -> String {
    format!("/{}/gr{}/ch{}", card, gr, ch)
}

/// Serialize one waveform record into `record`, replacing its contents.
pub fn encode_record(
    record: &mut Vec<u8>,
    pattern: u16,
    samples: ArrayView1<u16>,
    name: &str,
) -> Result<(), DispatchError> {
    let n_samples = u16::try_from(samples.len())
        .map_err(|_| DispatchError::TooManySamples(samples.len()))?;
    let name_len =
        u16::try_from(name.len()).map_err(|_| DispatchError::NameTooLong(name.to_string()))?;
    let body = FIXED_BYTES + samples.len() * 2 + name.len();
    let length = u16::try_from(body).map_err(|_| DispatchError::RecordTooLarge(body))?;

    record.clear();
    record.resize(2 + body, 0);
    LittleEndian::write_u16(&mut record[0..2], length);
    record[2] = (pattern & 0xFF) as u8;
    record[3] = SAMPLE_WIDTH;
    LittleEndian::write_u16(&mut record[4..6], n_samples);
    let mut pos = 6;
    for &sample in samples.iter() {
        LittleEndian::write_u16(&mut record[pos..pos + 2], sample);
        pos += 2;
    }
    LittleEndian::write_u16(&mut record[pos..pos + 2], name_len);
    record[pos + 2..].copy_from_slice(name.as_bytes());
    Ok(())
}

/// Streams raw waveforms of newly decoded events to a set of byte sinks.
pub struct Dispatcher<W: Write> {
    settings: Arc<CardSettings>,
    sinks: Vec<W>,
    record: Vec<u8>,
}

impl<W: Write> Dispatcher<W> {
    pub fn new(settings: Arc<CardSettings>, sinks: Vec<W>) -> Self {
        Self {
            settings,
            sinks,
            record: Vec::new(),
        }
    }

    pub fn sinks(&self) -> &[W] {
        &self.sinks
    }

    pub fn into_sinks(self) -> Vec<W> {
        self.sinks
    }

    /// Send every event between the buffer's dispatch cursor and the events
    /// ready, one record per enabled channel, then move the cursor.
    ///
    /// A sink that fails is dropped for the rest of the pass. A record that
    /// cannot be encoded stops the pass with the cursor on its event.
    pub fn dispatch(&mut self, buffer: &mut EventBuffer) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();
        let mut live = vec![true; self.sinks.len()];
        let ready = buffer.events_ready();

        for ev in buffer.dispatch_index()..ready {
            for gr in self.settings.active_groups() {
                let Some(group) = buffer.group(gr) else {
                    continue;
                };
                let pattern = group.meta(ev).pattern;
                for ch in (0..CHANNELS).filter(|&ch| self.settings.channel_enabled(gr, ch)) {
                    let name = channel_name(self.settings.index(), gr, ch);
                    encode_record(&mut self.record, pattern, group.waveform(ch, ev), &name)?;
                    for (idx, sink) in self.sinks.iter_mut().enumerate() {
                        if !live[idx] {
                            continue;
                        }
                        if let Err(e) = sink.write_all(&self.record) {
                            error!("Stream sink {} failed, skipping it for this pass: {}", idx, e);
                            live[idx] = false;
                            report.failed_sinks.push((idx, e));
                        }
                    }
                    report.records += 1;
                }
            }
            buffer.set_dispatch_index(ev + 1);
            report.events += 1;
        }

        if report.events > 0 {
            debug!(
                "Dispatched {} events ({} records) to {} sinks",
                report.events,
                report.records,
                live.iter().filter(|&&l| l).count()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder;
    use crate::wire::{EventEncoder, GroupData};
    use crate::writer::ArchiveWriter;
    use std::ops::Range;

    const N_SAMPLES: usize = 4;

    struct Sink {
        data: Vec<u8>,
        /// Fail once this many bytes have been written.
        fail_after: Option<usize>,
    }

    impl Sink {
        fn ok() -> Self {
            Self {
                data: Vec::new(),
                fail_after: None,
            }
        }

        fn failing(after: usize) -> Self {
            Self {
                data: Vec::new(),
                fail_after: Some(after),
            }
        }
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_after.is_some_and(|n| self.data.len() >= n) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn settings() -> Arc<CardSettings> {
        let mut mask = [false; CHANNELS];
        mask[1] = true;
        mask[6] = true;
        Arc::new(
            CardSettings::new("V1742_0", N_SAMPLES)
                .with_group(0, mask)
                .with_group(3, [false; CHANNELS]),
        )
    }

    fn group(value: u16) -> GroupData {
        GroupData {
            start_cell: 0,
            samples: std::array::from_fn(|ch| {
                (0..N_SAMPLES).map(|s| value + (ch * 10 + s) as u16).collect()
            }),
            tr: None,
        }
    }

    fn capture(events: Range<u32>) -> Vec<u8> {
        let mut enc = EventEncoder::new();
        for ev in events {
            let value = 100 * (ev as u16 + 1);
            let groups = [Some(group(value)), None, None, Some(group(value))];
            enc.event(0x1234 + ev as u16, ev, 0, &groups);
        }
        enc.to_bytes()
    }

    fn decoder_with(events: u32) -> Decoder {
        let mut decoder = Decoder::new(settings(), 16);
        decoder.decode(&capture(0..events)).unwrap();
        decoder
    }

    /// First sample of every record in a sink.
    fn first_samples(data: &[u8]) -> Vec<u16> {
        let mut firsts = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let length = LittleEndian::read_u16(&data[pos..pos + 2]) as usize;
            firsts.push(LittleEndian::read_u16(&data[pos + 6..pos + 8]));
            pos += 2 + length;
        }
        firsts
    }

    #[test]
    fn test_record_layout() {
        let mut decoder = decoder_with(1);
        let mut dispatcher = Dispatcher::new(settings(), vec![Sink::ok()]);
        let report = dispatcher.dispatch(decoder.buffer_mut()).unwrap();
        assert_eq!(report.events, 1);
        assert_eq!(report.records, 2);

        let name = b"/V1742_0/gr0/ch1";
        let data = &dispatcher.sinks()[0].data;
        let length = 1 + 1 + 2 + 2 * N_SAMPLES + 2 + name.len();
        assert_eq!(LittleEndian::read_u16(&data[0..2]) as usize, length);
        assert_eq!(data[2], 0x34);
        assert_eq!(data[3], 2);
        assert_eq!(LittleEndian::read_u16(&data[4..6]), N_SAMPLES as u16);
        let samples: Vec<u16> = (0..N_SAMPLES)
            .map(|s| LittleEndian::read_u16(&data[6 + 2 * s..8 + 2 * s]))
            .collect();
        assert_eq!(samples, vec![110, 111, 112, 113]);
        let name_at = 6 + 2 * N_SAMPLES;
        assert_eq!(LittleEndian::read_u16(&data[name_at..name_at + 2]) as usize, name.len());
        assert_eq!(&data[name_at + 2..2 + length], name);

        // second record is channel 6; group 3 has no enabled channels
        let second = &data[2 + length..];
        assert_eq!(second.len(), 2 + length);
        assert!(second.ends_with(b"/V1742_0/gr0/ch6"));
    }

    #[test]
    fn test_each_event_sent_once_across_archiving() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = Decoder::new(settings(), 16);
        let mut dispatcher = Dispatcher::new(settings(), vec![Sink::ok()]);
        let writer = ArchiveWriter::new(settings(), None);

        decoder.decode(&capture(0..5)).unwrap();
        assert_eq!(dispatcher.dispatch(decoder.buffer_mut()).unwrap().events, 5);
        writer
            .write_file(&dir.path().join("run0_0.h5"), decoder.buffer_mut(), 3)
            .unwrap();
        assert_eq!(decoder.buffer().dispatch_index(), 2);
        assert_eq!(dispatcher.dispatch(decoder.buffer_mut()).unwrap().events, 0);

        decoder.decode(&capture(5..7)).unwrap();
        assert_eq!(dispatcher.dispatch(decoder.buffer_mut()).unwrap().events, 2);
        decoder.buffer_mut().evict(4).unwrap();
        decoder.decode(&capture(7..9)).unwrap();
        assert_eq!(dispatcher.dispatch(decoder.buffer_mut()).unwrap().events, 2);

        // channel 1 then channel 6 for every event, in trigger order
        let expected: Vec<u16> = (1..=9u16).flat_map(|ev| [100 * ev + 10, 100 * ev + 60]).collect();
        assert_eq!(first_samples(&dispatcher.sinks()[0].data), expected);
    }

    #[test]
    fn test_cursor_advances_once_per_event() {
        let mut decoder = decoder_with(3);
        let mut dispatcher = Dispatcher::new(settings(), vec![Sink::ok(), Sink::ok()]);
        let report = dispatcher.dispatch(decoder.buffer_mut()).unwrap();
        assert_eq!(report.events, 3);
        assert_eq!(decoder.buffer().dispatch_index(), 3);

        // nothing new to send
        let report = dispatcher.dispatch(decoder.buffer_mut()).unwrap();
        assert_eq!(report.events, 0);
        assert_eq!(report.records, 0);
        let sinks = dispatcher.into_sinks();
        assert_eq!(sinks[0].data, sinks[1].data);
    }

    #[test]
    fn test_failing_sink_is_isolated() {
        let mut decoder = decoder_with(2);
        let mut dispatcher =
            Dispatcher::new(settings(), vec![Sink::failing(1), Sink::ok(), Sink::failing(0)]);
        let report = dispatcher.dispatch(decoder.buffer_mut()).unwrap();

        assert_eq!(report.events, 2);
        assert_eq!(report.records, 4);
        let failed: Vec<usize> = report.failed_sinks.iter().map(|(idx, _)| *idx).collect();
        assert_eq!(failed, vec![2, 0]);
        assert_eq!(decoder.buffer().dispatch_index(), 2);

        let sinks = dispatcher.into_sinks();
        let record_len = 2 + 1 + 1 + 2 + 2 * N_SAMPLES + 2 + "/V1742_0/gr0/ch1".len();
        assert_eq!(sinks[0].data.len(), record_len);
        assert_eq!(sinks[1].data.len(), 4 * record_len);
        assert!(sinks[2].data.is_empty());
    }

    #[test]
    fn test_oversized_record_keeps_cursor() {
        let samples = ndarray::Array1::<u16>::zeros(u16::MAX as usize);
        let mut record = Vec::new();
        assert!(matches!(
            encode_record(&mut record, 0, samples.view(), "/c/gr0/ch0"),
            Err(DispatchError::RecordTooLarge(_))
        ));

        let samples = ndarray::Array1::<u16>::zeros(u16::MAX as usize + 1);
        assert!(matches!(
            encode_record(&mut record, 0, samples.view(), "/c/gr0/ch0"),
            Err(DispatchError::TooManySamples(_))
        ));

        let name = "x".repeat(u16::MAX as usize + 1);
        let mut decoder = Decoder::new(
            Arc::new(CardSettings::new(&name, N_SAMPLES).with_group(0, [true; CHANNELS])),
            4,
        );
        let mut enc = EventEncoder::new();
        enc.event(0, 0, 0, &[Some(group(1))]);
        decoder.decode(&enc.to_bytes()).unwrap();
        let settings = Arc::new(decoder.settings().clone());
        let mut dispatcher = Dispatcher::new(settings, vec![Sink::ok()]);
        assert!(matches!(
            dispatcher.dispatch(decoder.buffer_mut()),
            Err(DispatchError::NameTooLong(_))
        ));
        assert_eq!(decoder.buffer().dispatch_index(), 0);
        assert!(dispatcher.sinks()[0].data.is_empty());
    }
}
