//! Time-tagged record streams.
//!
//! Every TTTR layout packs a photon into one little-endian `u32` whose time
//! field is far too narrow for a whole measurement. The instruments insert
//! overflow records whenever the field rolls over, so the absolute time is a
//! running base (advanced by each overflow) plus the field of the photon.
//! The vendor modules only describe how to split a raw word, the
//! bookkeeping of the base is shared here.

use std::io::{ErrorKind, Read};

use crate::photon::{Record, RecordMode, T2, T3};
use crate::picoquant::{DecodeStats, Marker, MarkerSink, RecordStream};
use crate::{DecodeError, Phase};

/// One raw record split into its meaning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RawEvent {
    T2 { channel: u32, time: u32 },
    T3 { channel: u32, nsync: u32, dtime: u32 },
    /// The time field rolled over `count` times. Formats without a count
    /// field report 1.
    Overflow { count: u32 },
    /// External marker inputs, `channels` being the bit mask of the
    /// inputs that fired and `field` the time field of the record.
    Marker { channels: u32, field: u32 },
    /// A bit pattern the instrument never writes.
    Invalid,
}

/// How a vendor packs photons into raw 32-bit records.
pub(crate) trait RecordLayout {
    const MODE: RecordMode;
    /// Modulus of the time field (T2) or sync counter (T3).
    const WRAP: i64;

    fn decode(&self, raw: u32) -> RawEvent;
}

/// Extracts `width` bits starting at bit `shift`.
#[inline]
pub(crate) fn bits(raw: u32, shift: u32, width: u32) -> u32 {
    (raw >> shift) & ((1u32 << width) - 1)
}

/// Streams canonical records out of a sequence of raw records.
pub(crate) struct TttrStream<R, L> {
    reader: R,
    layout: L,
    /// Multiplier turning T2 ticks into picoseconds
    tick: i64,
    base: i64,
    declared: Option<u64>,
    markers: Box<dyn MarkerSink>,
    stats: DecodeStats,
}

impl<R: Read, L: RecordLayout> TttrStream<R, L> {
    /// `declared` is the record count from the sub-header. Instruments
    /// that stream to disk leave it at zero, in which case the stream runs
    /// to the end of the file.
    pub(crate) fn new(reader: R, layout: L, declared: i64, markers: Box<dyn MarkerSink>) -> Self {
        let declared = if declared > 0 {
            Some(declared as u64)
        } else {
            debug!("No record count declared, reading until the end of the file");
            None
        };
        TttrStream {
            reader,
            layout,
            tick: 1,
            base: 0,
            declared,
            markers,
            stats: DecodeStats::default(),
        }
    }

    pub(crate) fn with_tick(mut self, tick: i64) -> Self {
        self.tick = tick;
        self
    }

    /// Reads the next raw word. A clean end of file yields `None`, a word
    /// cut short is an error.
    fn read_raw(&mut self) -> Result<Option<u32>, DecodeError> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(DecodeError::read(Phase::Record(self.stats.records + 1), e)),
            }
        }
        match filled {
            0 => Ok(None),
            4 => Ok(Some(u32::from_le_bytes(buf))),
            _ => Err(DecodeError::read(
                Phase::Record(self.stats.records + 1),
                std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("record cut short after {} bytes", filled),
                ),
            )),
        }
    }

    fn overflow(&mut self, count: u32) {
        if count > 1 {
            warn!(
                "{}",
                DecodeError::MarkerOverflowInconsistent {
                    record: self.stats.records,
                    count
                }
            );
            self.stats.inconsistent_overflows += 1;
        }
        self.base += L::WRAP * i64::from(count.max(1));
        self.stats.overflows += 1;
    }

    fn marker(&mut self, channels: u32, field: u32) {
        let mut time = self.base + i64::from(field);
        if L::MODE == RecordMode::T2 {
            time *= self.tick;
        }
        self.stats.markers += 1;
        self.markers.marker(Marker {
            record: self.stats.records,
            channels,
            time,
        });
    }
}

impl<R: Read, L: RecordLayout> RecordStream for TttrStream<R, L> {
    fn mode(&self) -> RecordMode {
        L::MODE
    }

    fn next_record(&mut self) -> Result<Option<Record>, DecodeError> {
        loop {
            if let Some(declared) = self.declared {
                if self.stats.records >= declared {
                    return Ok(None);
                }
            }
            let raw = match self.read_raw()? {
                Some(raw) => raw,
                None => {
                    if let Some(declared) = self.declared {
                        warn!(
                            "File ended after {} of {} declared records",
                            self.stats.records, declared
                        );
                    }
                    return Ok(None);
                }
            };
            self.stats.records += 1;

            match self.layout.decode(raw) {
                RawEvent::Overflow { count } => self.overflow(count),
                RawEvent::Marker { channels, field } => self.marker(channels, field),
                RawEvent::Invalid => {
                    return Err(DecodeError::InvalidRecord {
                        record: self.stats.records,
                        raw,
                    })
                }
                RawEvent::T2 { channel, time } => {
                    self.stats.photons += 1;
                    let time = (self.base + i64::from(time)) * self.tick;
                    return Ok(Some(T2::new(channel, time).into()));
                }
                RawEvent::T3 {
                    channel,
                    nsync,
                    dtime,
                } => {
                    self.stats.photons += 1;
                    let pulse = self.base + i64::from(nsync);
                    return Ok(Some(T3::new(channel, pulse, i64::from(dtime)).into()));
                }
            }
        }
    }

    fn stats(&self) -> DecodeStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Top bit flags an overflow carrying a count in the low byte, bit 30 a
    /// marker, everything else is a channel 0 photon.
    struct ToyLayout;

    impl RecordLayout for ToyLayout {
        const MODE: RecordMode = RecordMode::T2;
        const WRAP: i64 = 1000;

        fn decode(&self, raw: u32) -> RawEvent {
            if raw & 0x8000_0000 != 0 {
                RawEvent::Overflow { count: raw & 0xff }
            } else if raw & 0x4000_0000 != 0 {
                RawEvent::Marker {
                    channels: 1,
                    field: raw & 0xffff,
                }
            } else {
                RawEvent::T2 {
                    channel: 0,
                    time: raw,
                }
            }
        }
    }

    fn words(raw: &[u32]) -> Vec<u8> {
        raw.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn collect<R: Read>(stream: &mut TttrStream<R, ToyLayout>) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(r) = stream.next_record().unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn bits_extracts_fields() {
        let raw = 0xF123_4567;
        assert_eq!(bits(raw, 28, 4), 0xF);
        assert_eq!(bits(raw, 0, 16), 0x4567);
        assert_eq!(bits(raw, 16, 12), 0x123);
    }

    #[test]
    fn overflows_advance_the_base() {
        let data = words(&[5, 0x8000_0001, 7, 0x8000_0000, 0x8000_0001, 1]);
        let mut stream = TttrStream::new(&data[..], ToyLayout, 6, Box::new(Vec::<Marker>::new())).with_tick(2);
        let records = collect(&mut stream);
        assert_eq!(
            records,
            vec![
                T2::new(0, 10).into(),
                T2::new(0, 2014).into(),
                T2::new(0, 6002).into()
            ]
        );
        let stats = stream.stats();
        assert_eq!(stats.records, 6);
        assert_eq!(stats.photons, 3);
        assert_eq!(stats.overflows, 3);
        assert_eq!(stats.inconsistent_overflows, 0);
    }

    #[test]
    fn implausible_overflow_is_counted_but_applied() {
        let data = words(&[0x8000_0003, 1]);
        let mut stream = TttrStream::new(&data[..], ToyLayout, 0, Box::new(Vec::<Marker>::new()));
        assert_eq!(collect(&mut stream), vec![T2::new(0, 3001).into()]);
        assert_eq!(stream.stats().inconsistent_overflows, 1);
    }

    #[test]
    fn declared_count_bounds_the_stream() {
        let data = words(&[1, 2, 3]);
        let mut stream = TttrStream::new(&data[..], ToyLayout, 2, Box::new(Vec::<Marker>::new()));
        assert_eq!(collect(&mut stream).len(), 2);
    }

    #[test]
    fn early_end_of_file_is_not_fatal() {
        let data = words(&[1, 2]);
        let mut stream = TttrStream::new(&data[..], ToyLayout, 10, Box::new(Vec::<Marker>::new()));
        assert_eq!(collect(&mut stream).len(), 2);
    }

    #[test]
    fn partial_record_is_fatal() {
        let mut data = words(&[1]);
        data.extend_from_slice(&[0, 1]);
        let mut stream = TttrStream::new(&data[..], ToyLayout, 0, Box::new(Vec::<Marker>::new()));
        assert!(stream.next_record().unwrap().is_some());
        match stream.next_record() {
            Err(DecodeError::Read { phase, .. }) => assert_eq!(phase, Phase::Record(2)),
            other => panic!("Expected a read error, got {:?}", other),
        }
    }

    #[test]
    fn markers_go_to_the_sink() {
        let (tx, rx) = crossbeam::channel::unbounded::<Marker>();
        let data = words(&[0x8000_0001, 0x4000_0005, 3]);
        let mut stream = TttrStream::new(&data[..], ToyLayout, 3, Box::new(tx)).with_tick(4);
        assert_eq!(collect(&mut stream), vec![T2::new(0, 4012).into()]);
        let marker = rx.try_recv().unwrap();
        assert_eq!(
            marker,
            Marker {
                record: 2,
                channels: 1,
                time: 4020
            }
        );
        assert_eq!(stream.stats().markers, 1);
    }
}
