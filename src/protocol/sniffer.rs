//! Prefix sniffer implementation
//!
//! Classifies a plaintext connection from its leading bytes. The sniffer never
//! performs I/O itself: the caller accumulates bytes and asks again each time
//! more arrive. Classification is recomputed from byte zero on every call, so
//! a partially classified buffer carries no hidden state.

use log::{debug, trace};

use super::{H2, HTTP_1_1, SPDY};

/// Client connection preface sent before any HTTP/2 frame
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// First byte of every SPDY control frame (control bit set, version high byte zero)
pub const SPDY_CONTROL_MARKER: u8 = 0x80;

/// Protocol detection result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionResult {
    /// A definitive protocol label
    Protocol(&'static str),
    /// Need more data to determine protocol
    NeedMoreData,
}

impl DetectionResult {
    /// Whether a definitive classification was reached
    pub fn is_definitive(&self) -> bool {
        matches!(self, DetectionResult::Protocol(_))
    }
}

/// Protocol detector trait
///
/// This trait defines the interface for protocol detection over an
/// accumulating byte buffer.
pub trait ProtocolDetector: Send + Sync {
    /// Classify the bytes seen so far on a connection
    ///
    /// # Parameters
    ///
    /// * `data` - Every byte received so far, starting at the first one
    ///
    /// # Returns
    ///
    /// Returns a protocol label, or `NeedMoreData` while the prefix is ambiguous
    fn detect(&self, data: &[u8]) -> DetectionResult;

    /// Upper bound of bytes this detector may ask for before it is definitive
    fn max_prefix_len(&self) -> usize;
}

/// Prefix sniffer
///
/// Distinguishes SPDY (by its first byte), HTTP/2 (by the full client preface)
/// and falls back to HTTP/1.1 at the first byte that diverges from the preface.
#[derive(Debug, Clone)]
pub struct PrefixSniffer {
    /// Fixed preface of the fixed-preface protocol
    preface: &'static [u8],
    /// Distinguishing first byte of the binary-framed protocol
    marker: u8,
}

impl Default for PrefixSniffer {
    fn default() -> Self {
        Self {
            preface: H2_PREFACE,
            marker: SPDY_CONTROL_MARKER,
        }
    }
}

impl PrefixSniffer {
    /// Create a sniffer with a custom preface and marker byte
    pub fn new(preface: &'static [u8], marker: u8) -> Self {
        Self { preface, marker }
    }
}

impl ProtocolDetector for PrefixSniffer {
    fn detect(&self, data: &[u8]) -> DetectionResult {
        let Some(&first) = data.first() else {
            return DetectionResult::NeedMoreData;
        };

        if first == self.marker {
            debug!("SPDY control frame marker detected");
            return DetectionResult::Protocol(SPDY);
        }

        let compared = data.len().min(self.preface.len());
        if let Some(pos) = data[..compared]
            .iter()
            .zip(self.preface)
            .position(|(got, want)| got != want)
        {
            debug!("Preface mismatch at byte {}: {:#04x}, falling back to {}", pos, data[pos], HTTP_1_1);
            return DetectionResult::Protocol(HTTP_1_1);
        }

        if compared == self.preface.len() {
            debug!("HTTP/2 connection preface detected");
            DetectionResult::Protocol(H2)
        } else {
            trace!("Preface prefix matched {} of {} bytes", compared, self.preface.len());
            DetectionResult::NeedMoreData
        }
    }

    fn max_prefix_len(&self) -> usize {
        self.preface.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer_needs_more() {
        let sniffer = PrefixSniffer::default();
        assert_eq!(sniffer.detect(&[]), DetectionResult::NeedMoreData);
    }

    #[test]
    fn test_every_proper_preface_prefix_needs_more() {
        let sniffer = PrefixSniffer::default();
        for len in 1..H2_PREFACE.len() {
            assert_eq!(
                sniffer.detect(&H2_PREFACE[..len]),
                DetectionResult::NeedMoreData,
                "prefix of length {} classified too early",
                len
            );
        }
    }

    #[test]
    fn test_spdy_marker_wins_regardless_of_tail() {
        let sniffer = PrefixSniffer::default();
        assert_eq!(sniffer.detect(&[0x80]), DetectionResult::Protocol(SPDY));
        assert_eq!(sniffer.detect(&[0x80, 0x03, 0x00, 0x01]), DetectionResult::Protocol(SPDY));

        let mut tail = vec![0x80];
        tail.extend_from_slice(H2_PREFACE);
        assert_eq!(sniffer.detect(&tail), DetectionResult::Protocol(SPDY));
    }

    #[test]
    fn test_preface_split_across_reads() {
        let sniffer = PrefixSniffer::default();
        let mut buffer = Vec::new();

        buffer.extend_from_slice(&H2_PREFACE[..10]);
        assert!(!sniffer.detect(&buffer).is_definitive());

        buffer.extend_from_slice(&H2_PREFACE[10..]);
        assert_eq!(sniffer.detect(&buffer), DetectionResult::Protocol(H2));
    }

    #[test]
    fn test_preface_followed_by_frames() {
        let sniffer = PrefixSniffer::default();
        let mut buffer = H2_PREFACE.to_vec();
        buffer.extend_from_slice(&[0x00, 0x00, 0x00, 0x04, 0x00]);
        assert_eq!(sniffer.detect(&buffer), DetectionResult::Protocol(H2));
    }

    #[test]
    fn test_http1_mismatch_at_first_byte() {
        let sniffer = PrefixSniffer::default();
        assert_eq!(sniffer.detect(b"GET / HTTP/1.1\r\n"), DetectionResult::Protocol(HTTP_1_1));
        // A single byte is already enough
        assert_eq!(sniffer.detect(b"G"), DetectionResult::Protocol(HTTP_1_1));
    }

    #[test]
    fn test_divergence_uses_only_k_plus_one_bytes() {
        let sniffer = PrefixSniffer::default();
        for k in 0..H2_PREFACE.len() {
            let mut data = H2_PREFACE[..k].to_vec();
            // 0x00 never appears in the preface and is not the SPDY marker
            data.push(0x00);
            assert_eq!(
                sniffer.detect(&data),
                DetectionResult::Protocol(HTTP_1_1),
                "divergence at {} not classified",
                k
            );
        }
    }

    #[test]
    fn test_pri_method_that_is_not_the_preface() {
        let sniffer = PrefixSniffer::default();
        assert_eq!(sniffer.detect(b"PRI * HTTP/1.1\r\n"), DetectionResult::Protocol(HTTP_1_1));
    }

    #[test]
    fn test_custom_preface() {
        let sniffer = PrefixSniffer::new(b"HELLO", 0xff);
        assert_eq!(sniffer.detect(b"HEL"), DetectionResult::NeedMoreData);
        assert_eq!(sniffer.detect(b"HELLO"), DetectionResult::Protocol(H2));
        assert_eq!(sniffer.detect(&[0xff]), DetectionResult::Protocol(SPDY));
        assert_eq!(sniffer.max_prefix_len(), 5);
    }
}
