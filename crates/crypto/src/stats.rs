//! Zaehler je Medientyp
//!
//! Encryptor und Decryptor fuehren je Medientyp einen Satz atomarer
//! Zaehler. Snapshots werden alle 10 Sekunden per `tracing`
//! zusammengefasst; die Kadenz ist beratend, nicht praezise.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomare Zaehler fuer eine Richtung der Pipeline (ein Medientyp)
#[derive(Debug, Default)]
pub struct MediaStats {
    /// AEAD-Aufrufe insgesamt (inklusive Codec-Retries)
    pub attempts: AtomicU64,
    /// Hoechste Versuchszahl eines einzelnen Frames
    pub max_attempts: AtomicU64,
    /// Erfolgreich verarbeitete Frames
    pub success_count: AtomicU64,
    /// Fehlgeschlagene Frames
    pub failure_count: AtomicU64,
    /// Unverschluesselt durchgereichte Frames
    pub passthrough_count: AtomicU64,
    /// Aufsummierte Verarbeitungsdauer in Mikrosekunden
    pub duration_us: AtomicU64,
}

impl MediaStats {
    pub(crate) fn record_attempt(&self, attempt: u64) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.max_attempts.fetch_max(attempt, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MediaStatsSnapshot {
        MediaStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            max_attempts: self.max_attempts.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            passthrough_count: self.passthrough_count.load(Ordering::Relaxed),
            duration_us: self.duration_us.load(Ordering::Relaxed),
        }
    }
}

/// Momentaufnahme der Zaehler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStatsSnapshot {
    pub attempts: u64,
    pub max_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub passthrough_count: u64,
    pub duration_us: u64,
}

impl MediaStatsSnapshot {
    /// Gibt eine lesbare Zusammenfassung zurueck
    pub fn zusammenfassung(&self) -> String {
        format!(
            "ok={} fehl={} passthrough={} versuche={} (max {}) dauer={}us",
            self.success_count,
            self.failure_count,
            self.passthrough_count,
            self.attempts,
            self.max_attempts,
            self.duration_us,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
