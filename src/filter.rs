//! Frequency-domain bandpass filtering of fixed-size blocks.
//!
//! Filtering works on blocks of `block_size` samples padded by a taper
//! margin on each side. The response is built once per band as a real
//! half-spectrum with cosine-squared roll-offs and multiplied into the
//! block's spectrum; overlapping tapered blocks are summed by the caller.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::channels::ChannelKind;
use crate::error::{RawError, Result};

/// Band corners and transition widths in Hz. A corner at or below zero
/// disables that edge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FilterBand {
    pub highpass: f32,
    pub lowpass: f32,
    pub highpass_width: f32,
    pub lowpass_width: f32,
}

impl Default for FilterBand {
    fn default() -> Self {
        Self {
            highpass: 0.0,
            lowpass: 40.0,
            highpass_width: 0.0,
            lowpass_width: 5.0,
        }
    }
}

impl FilterBand {
    /// Corner equality within 0.1 Hz, loose enough to absorb settings
    /// round-tripped through a UI.
    pub fn matches(&self, other: &FilterBand) -> bool {
        (self.highpass - other.highpass).abs() <= 0.1
            && (self.lowpass - other.lowpass).abs() <= 0.1
            && (self.highpass_width - other.highpass_width).abs() <= 0.1
            && (self.lowpass_width - other.lowpass_width).abs() <= 0.1
    }
}

/// Full filter settings: the primary band for sensor channels, a separate
/// band for EOG channels, and the block geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDefinition {
    pub enabled: bool,
    pub band: FilterBand,
    pub eog_band: FilterBand,
    pub block_size: usize,
    pub taper_size: usize,
}

impl Default for FilterDefinition {
    fn default() -> Self {
        Self {
            enabled: false,
            band: FilterBand::default(),
            eog_band: FilterBand {
                highpass: 0.3,
                lowpass: 40.0,
                highpass_width: 0.0,
                lowpass_width: 5.0,
            },
            block_size: 4096,
            taper_size: 2048,
        }
    }
}

impl FilterDefinition {
    /// Whether an existing engine built from `other` can serve this
    /// definition without rebuilding responses.
    pub fn matches(&self, other: &FilterDefinition) -> bool {
        self.enabled == other.enabled
            && self.block_size == other.block_size
            && self.taper_size == other.taper_size
            && self.band.matches(&other.band)
            && self.eog_band.matches(&other.eog_band)
    }
}

/// Precomputed responses plus FFT plans for one block geometry.
pub struct FilterResponseEngine {
    n: usize,
    taper: usize,
    primary: Vec<f32>,
    eog: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
}

impl FilterResponseEngine {
    pub fn new(def: &FilterDefinition, sample_rate: f32) -> Self {
        let n = def.block_size + 2 * def.taper_size;
        let mut planner = FftPlanner::new();
        Self {
            n,
            taper: def.taper_size,
            primary: build_response(n, sample_rate, &def.band),
            eog: build_response(n, sample_rate, &def.eog_band),
            fft: planner.plan_fft_forward(n),
            ifft: planner.plan_fft_inverse(n),
        }
    }

    /// Padded block length the engine operates on.
    pub fn block_len(&self) -> usize {
        self.n
    }

    pub fn taper_len(&self) -> usize {
        self.taper
    }

    pub fn response_for(&self, kind: ChannelKind) -> &[f32] {
        match kind {
            ChannelKind::Eog => &self.eog,
            _ => &self.primary,
        }
    }

    /// Filter one channel's padded block in place.
    ///
    /// Stimulus channels pass through untouched, bit for bit. With
    /// `zero_pad` the taper margins are cleared first (block at a stream
    /// edge); `dc` is subtracted from the active region before the
    /// transform so the edges do not ring against a large offset.
    pub fn apply(
        &self,
        data: &mut [f32],
        zero_pad: bool,
        dc: f32,
        kind: ChannelKind,
    ) -> Result<()> {
        if kind == ChannelKind::Stimulus {
            return Ok(());
        }
        if data.len() != self.n {
            return Err(RawError::DimensionMismatch {
                expected: self.n,
                found: data.len(),
            });
        }

        if zero_pad {
            data[..self.taper].fill(0.0);
            data[self.n - self.taper..].fill(0.0);
        }
        if dc != 0.0 {
            for v in data[self.taper..self.n - self.taper].iter_mut() {
                *v -= dc;
            }
        }

        let response = self.response_for(kind);
        let mut spectrum: Vec<Complex<f32>> =
            data.iter().map(|&v| Complex::new(v, 0.0)).collect();
        self.fft.process(&mut spectrum);
        for (k, bin) in spectrum.iter_mut().enumerate() {
            // real response, mirrored onto the upper half
            let r = response[k.min(self.n - k)];
            *bin *= r;
        }
        self.ifft.process(&mut spectrum);
        let scale = 1.0 / self.n as f32;
        for (out, bin) in data.iter_mut().zip(spectrum.iter()) {
            *out = bin.re * scale;
        }
        Ok(())
    }
}

/// Half-spectrum magnitude response, `n/2 + 1` bins.
fn build_response(n: usize, sample_rate: f32, band: &FilterBand) -> Vec<f32> {
    let nfreq = n / 2 + 1;
    let df = sample_rate / n as f32;
    let mut resp = vec![1.0f32; nfreq];

    if band.highpass > 0.0 {
        // narrow default transition when no width is given
        let width = if band.highpass_width > 0.0 {
            band.highpass_width
        } else {
            3.0 * df
        };
        let lo = band.highpass - width / 2.0;
        for (k, r) in resp.iter_mut().enumerate() {
            let f = k as f32 * df;
            if f <= lo {
                *r = 0.0;
            } else if f < lo + width {
                let phase = std::f32::consts::FRAC_PI_2 * (f - lo) / width;
                *r *= phase.sin().powi(2);
            }
        }
    }

    if band.lowpass > 0.0 {
        let width = if band.lowpass_width > 0.0 {
            band.lowpass_width
        } else {
            3.0 * df
        };
        let lo = band.lowpass - width / 2.0;
        for (k, r) in resp.iter_mut().enumerate() {
            let f = k as f32 * df;
            if f >= lo + width {
                *r = 0.0;
            } else if f > lo {
                let phase = std::f32::consts::FRAC_PI_2 * (f - lo) / width;
                *r *= phase.cos().powi(2);
            }
        }
    }

    resp
}
