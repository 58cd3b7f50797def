//! Panning tables for a device layout
//!
//! Builds the virtual-to-physical channel matrix used when writing the dry
//! buffer out, and a lookup table that maps a quantized horizontal
//! direction to one gain per speaker. Between two neighbouring speakers the
//! gains follow a quarter-sine crossfade, so a source exactly on a speaker
//! angle plays only from that speaker.

use crate::channel::{Channel, DevChannels, MAX_CHANNELS};
use crate::config::ConfigValues;
use crate::error::{PetalSonicError, Result};
use std::f32::consts::{FRAC_1_SQRT_2, FRAC_PI_2, PI};

/// Number of directions in the panning lookup table.
pub const LUT_NUM: usize = 512;
/// Directions per quadrant.
pub const QUADRANT_NUM: usize = LUT_NUM / 4;

pub type ChannelMatrix = [[f32; MAX_CHANNELS]; MAX_CHANNELS];

/// Channel matrix, speaker arrangement and direction table of one device.
#[derive(Debug, Clone)]
pub struct Panning {
    matrix: ChannelMatrix,
    /// Positional speakers sorted by ascending angle.
    speakers: Vec<Channel>,
    /// Angle of each entry of `speakers`, radians in [-π, π].
    angles: Vec<f32>,
    lut: Box<[[f32; MAX_CHANNELS]; LUT_NUM]>,
}

impl Panning {
    /// Builds the tables for `layout`, applying any `layout_*` angle overrides
    /// and the `scalemix` flag found in `config`.
    pub fn new(layout: DevChannels, config: &ConfigValues) -> Result<Self> {
        let mut matrix = identity_matrix();
        apply_downmix(&mut matrix, layout);

        let (mut speakers, mut angles) = default_arrangement(layout);
        if layout != DevChannels::Mono {
            let key = format!("layout_{}", layout.config_name());
            let key = if config.get(&key).is_some() { key } else { "layout".to_string() };
            if let Some(layout_str) = config.get(&key) {
                apply_angle_overrides(&key, layout_str, &speakers, &mut angles);
            }
            sort_by_angle(&mut speakers, &mut angles);
        }

        if speakers.is_empty() {
            return Err(PetalSonicError::Configuration(format!(
                "layout {:?} has no positional speakers",
                layout
            )));
        }

        if config.get_bool("scalemix", false)? {
            scale_matrix(&mut matrix);
        }

        let lut = build_lut(&speakers, &angles);

        log::info!(
            "Panning for {:?}: speakers {:?} at {:?} degrees",
            layout,
            speakers,
            angles.iter().map(|a| a.to_degrees().round()).collect::<Vec<_>>()
        );

        Ok(Self {
            matrix,
            speakers,
            angles,
            lut,
        })
    }

    /// Gain of virtual channel `from` on output channel `to`.
    pub fn matrix(&self) -> &ChannelMatrix {
        &self.matrix
    }

    /// Positional speakers, ascending by angle.
    pub fn speakers(&self) -> &[Channel] {
        &self.speakers
    }

    pub fn speaker_angles(&self) -> &[f32] {
        &self.angles
    }

    pub fn num_speakers(&self) -> usize {
        self.speakers.len()
    }

    /// Per-channel gains for LUT direction `pos` (taken modulo [`LUT_NUM`]).
    #[inline]
    pub fn lut(&self, pos: usize) -> &[f32; MAX_CHANNELS] {
        &self.lut[pos % LUT_NUM]
    }
}

fn identity_matrix() -> ChannelMatrix {
    let mut matrix = [[0.0; MAX_CHANNELS]; MAX_CHANNELS];
    for (i, row) in matrix.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    matrix
}

fn apply_downmix(m: &mut ChannelMatrix, layout: DevChannels) {
    use Channel::*;
    let mut set = |from: Channel, to: Channel, gain: f32| m[from.index()][to.index()] = gain;
    match layout {
        DevChannels::Mono => {
            for from in [FrontLeft, FrontRight, SideLeft, SideRight, BackLeft, BackRight] {
                set(from, FrontCenter, FRAC_1_SQRT_2);
            }
            set(BackCenter, FrontCenter, 1.0);
        }
        DevChannels::Stereo => {
            set(FrontCenter, FrontLeft, FRAC_1_SQRT_2);
            set(FrontCenter, FrontRight, FRAC_1_SQRT_2);
            set(SideLeft, FrontLeft, 1.0);
            set(SideRight, FrontRight, 1.0);
            set(BackLeft, FrontLeft, 1.0);
            set(BackRight, FrontRight, 1.0);
            set(BackCenter, FrontLeft, FRAC_1_SQRT_2);
            set(BackCenter, FrontRight, FRAC_1_SQRT_2);
        }
        DevChannels::Quad => {
            set(FrontCenter, FrontLeft, FRAC_1_SQRT_2);
            set(FrontCenter, FrontRight, FRAC_1_SQRT_2);
            set(SideLeft, FrontLeft, FRAC_1_SQRT_2);
            set(SideLeft, BackLeft, FRAC_1_SQRT_2);
            set(SideRight, FrontRight, FRAC_1_SQRT_2);
            set(SideRight, BackRight, FRAC_1_SQRT_2);
            set(BackCenter, BackLeft, FRAC_1_SQRT_2);
            set(BackCenter, BackRight, FRAC_1_SQRT_2);
        }
        DevChannels::X51 => {
            set(SideLeft, FrontLeft, FRAC_1_SQRT_2);
            set(SideLeft, BackLeft, FRAC_1_SQRT_2);
            set(SideRight, FrontRight, FRAC_1_SQRT_2);
            set(SideRight, BackRight, FRAC_1_SQRT_2);
            set(BackCenter, BackLeft, FRAC_1_SQRT_2);
            set(BackCenter, BackRight, FRAC_1_SQRT_2);
        }
        DevChannels::X61 => {
            set(BackLeft, BackCenter, FRAC_1_SQRT_2);
            set(BackLeft, SideLeft, FRAC_1_SQRT_2);
            set(BackRight, BackCenter, FRAC_1_SQRT_2);
            set(BackRight, SideRight, FRAC_1_SQRT_2);
        }
        DevChannels::X71 => {
            set(BackCenter, BackLeft, FRAC_1_SQRT_2);
            set(BackCenter, BackRight, FRAC_1_SQRT_2);
        }
    }
}

fn default_arrangement(layout: DevChannels) -> (Vec<Channel>, Vec<f32>) {
    use Channel::*;
    let table: &[(Channel, f32)] = match layout {
        DevChannels::Mono => &[(FrontCenter, 0.0)],
        DevChannels::Stereo => &[(FrontLeft, -90.0), (FrontRight, 90.0)],
        DevChannels::Quad => &[
            (BackLeft, -135.0),
            (FrontLeft, -45.0),
            (FrontRight, 45.0),
            (BackRight, 135.0),
        ],
        DevChannels::X51 => &[
            (BackLeft, -110.0),
            (FrontLeft, -30.0),
            (FrontCenter, 0.0),
            (FrontRight, 30.0),
            (BackRight, 110.0),
        ],
        DevChannels::X61 => &[
            (SideLeft, -90.0),
            (FrontLeft, -30.0),
            (FrontCenter, 0.0),
            (FrontRight, 30.0),
            (SideRight, 90.0),
            (BackCenter, 180.0),
        ],
        DevChannels::X71 => &[
            (BackLeft, -150.0),
            (SideLeft, -90.0),
            (FrontLeft, -30.0),
            (FrontCenter, 0.0),
            (FrontRight, 30.0),
            (SideRight, 90.0),
            (BackRight, 150.0),
        ],
    };
    table
        .iter()
        .map(|&(chan, deg)| (chan, deg * (PI / 180.0)))
        .unzip()
}

/// Applies `name=degrees` pairs from a layout string. Only speakers present
/// in the layout are affected; unknown names and angles outside [-180, 180]
/// are reported and skipped.
fn apply_angle_overrides(key: &str, layout_str: &str, speakers: &[Channel], angles: &mut [f32]) {
    for entry in layout_str.split(',') {
        let entry = entry.trim();
        let Some((name, value)) = entry.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        let Some(channel) = Channel::from_speaker_name(name) else {
            log::warn!("Unknown speaker for {}: \"{}\"", key, name);
            continue;
        };
        let Some(idx) = speakers.iter().position(|&s| s == channel) else {
            continue;
        };

        match value.trim().parse::<i64>() {
            Ok(angle) if (-180..=180).contains(&angle) => {
                angles[idx] = angle as f32 * (PI / 180.0);
            }
            _ => log::warn!("Invalid angle for speaker \"{}\": {}", name, value.trim()),
        }
    }
}

/// Selection sort, keeping the speaker list aligned with its angles.
fn sort_by_angle(speakers: &mut [Channel], angles: &mut [f32]) {
    for i in 0..angles.len() {
        let mut min = i;
        for j in i + 1..angles.len() {
            if angles[j] < angles[min] {
                min = j;
            }
        }
        if min != i {
            angles.swap(i, min);
            speakers.swap(i, min);
        }
    }
}

/// Scales the matrix so no output channel can sum to more than 1.
fn scale_matrix(matrix: &mut ChannelMatrix) {
    let mut maxout = 1.0f32;
    for out in 0..MAX_CHANNELS {
        let sum: f32 = matrix.iter().map(|row| row[out]).sum();
        maxout = maxout.max(sum);
    }
    let scale = 1.0 / maxout;
    for row in matrix.iter_mut() {
        for v in row.iter_mut() {
            *v *= scale;
        }
    }
}

fn build_lut(speakers: &[Channel], angles: &[f32]) -> Box<[[f32; MAX_CHANNELS]; LUT_NUM]> {
    let mut lut = Box::new([[0.0f32; MAX_CHANNELS]; LUT_NUM]);
    let n = speakers.len();

    for (pos, gains) in lut.iter_mut().enumerate() {
        if n == 1 {
            gains[speakers[0].index()] = 1.0;
            continue;
        }

        let mut theta = lut_pos_to_angle(pos);
        let between = (0..n - 1).find(|&s| theta >= angles[s] && theta < angles[s + 1]);
        match between {
            Some(s) => {
                let alpha = FRAC_PI_2 * (theta - angles[s]) / (angles[s + 1] - angles[s]);
                gains[speakers[s].index()] = alpha.cos();
                gains[speakers[s + 1].index()] = alpha.sin();
            }
            None => {
                // between the last speaker and the first one, across ±π
                let last = n - 1;
                if theta < angles[0] {
                    theta += 2.0 * PI;
                }
                let alpha =
                    FRAC_PI_2 * (theta - angles[last]) / (2.0 * PI + angles[0] - angles[last]);
                gains[speakers[last].index()] = alpha.cos();
                gains[speakers[0].index()] = alpha.sin();
            }
        }
    }
    lut
}

/// Direction in radians of LUT entry `pos`. Index 0 is straight ahead,
/// positive angles turn right.
pub fn lut_pos_to_angle(pos: usize) -> f32 {
    let q = QUADRANT_NUM as f32;
    let p = pos as f32;
    if pos < QUADRANT_NUM {
        (p / (q - p)).atan()
    } else if pos < 2 * QUADRANT_NUM {
        FRAC_PI_2 + ((p - q) / (2.0 * q - p)).atan()
    } else if pos < 3 * QUADRANT_NUM {
        ((p - 2.0 * q) / (3.0 * q - p)).atan() - PI
    } else {
        ((p - 3.0 * q) / (4.0 * q - p)).atan() - FRAC_PI_2
    }
}

/// Quantizes a direction to a LUT index. `re` is the forward component,
/// `im` the rightward one.
pub fn cart_to_lut_pos(re: f32, im: f32) -> usize {
    let denom = re.abs() + im.abs();
    let mut pos: i32 = 0;
    if denom > 0.0 {
        pos = (QUADRANT_NUM as f32 * im.abs() / (denom + 0.5)) as i32;
    }
    if re < 0.0 {
        pos = 2 * QUADRANT_NUM as i32 - pos;
    }
    if im < 0.0 {
        pos = LUT_NUM as i32 - pos;
    }
    (pos as usize) % LUT_NUM
}
