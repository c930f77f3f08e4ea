use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use chrono::{Datelike, Local, Timelike};

use crate::bindless::CONSTANT_SLOT_SIZE;
use crate::channels::CHANNEL_COUNT;

/// CPU mirror of the `ToyviewFrame` std140 block. One per pass per frame,
/// written into that pass's constant slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub app_viewport: [f32; 4],
    pub resolution: [f32; 3],
    pub time: f32,
    pub time_delta: f32,
    pub frame_rate: f32,
    pub frame: i32,
    _pad0: f32,
    /// std140 float arrays have a 16 byte stride; only `.x` is read.
    pub channel_time: [[f32; 4]; CHANNEL_COUNT],
    /// `vec3` array, 16 byte stride.
    pub channel_resolution: [[f32; 4]; CHANNEL_COUNT],
    pub mouse: [f32; 4],
    pub date: [f32; 4],
    pub sample_rate: f32,
    _pad1: [f32; 11],
}

const _: () = assert!(std::mem::size_of::<FrameUniforms>() as u64 == CONSTANT_SLOT_SIZE);

impl FrameUniforms {
    pub fn new(width: u32, height: u32) -> Self {
        let mut uniforms = Self::zeroed();
        uniforms.set_resolution(width, height);
        uniforms.sample_rate = 44100.0;
        uniforms
    }

    pub fn set_resolution(&mut self, width: u32, height: u32) {
        let (width, height) = (width as f32, height as f32);
        self.resolution = [width, height, 1.0];
        self.app_viewport = [0.0, 0.0, width, height];
    }

    pub fn set_channel_resolution(&mut self, index: usize, resolution: [f32; 3]) {
        if let Some(slot) = self.channel_resolution.get_mut(index) {
            *slot = [resolution[0], resolution[1], resolution[2], 0.0];
        }
    }

    pub fn apply_sample(&mut self, sample: &FrameSample) {
        self.time = sample.time;
        self.time_delta = sample.delta;
        self.frame_rate = sample.frame_rate;
        self.frame = sample.frame;
        for channel in &mut self.channel_time {
            channel[0] = sample.time;
        }
        self.date = sample.date;
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Time values shared by every pass in a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameSample {
    pub time: f32,
    pub delta: f32,
    pub frame_rate: f32,
    pub frame: i32,
    pub date: [f32; 4],
}

/// Accumulates caller-supplied frame deltas into ShaderToy time.
#[derive(Debug, Default)]
pub struct FrameClock {
    elapsed: Duration,
    frame: u32,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart from time zero, frame zero. Called whenever a new graph goes live.
    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
        self.frame = 0;
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Samples the current frame, then advances by `delta`. The first frame
    /// after a reset always reports time zero.
    pub fn tick(&mut self, delta: Duration) -> FrameSample {
        let delta = if self.frame == 0 { Duration::ZERO } else { delta };
        self.elapsed += delta;
        let delta_secs = delta.as_secs_f32();
        let sample = FrameSample {
            time: self.elapsed.as_secs_f32(),
            delta: delta_secs,
            frame_rate: if delta_secs > 0.0 { 1.0 / delta_secs } else { 0.0 },
            frame: self.frame.min(i32::MAX as u32) as i32,
            date: current_date(),
        };
        self.frame = self.frame.saturating_add(1);
        sample
    }
}

fn current_date() -> [f32; 4] {
    let now = Local::now();
    let seconds_since_midnight =
        now.num_seconds_from_midnight() as f32 + now.nanosecond() as f32 / 1_000_000_000.0;
    [
        now.year() as f32,
        // ShaderToy follows JavaScript and counts months from zero.
        now.month0() as f32,
        now.day() as f32,
        seconds_since_midnight,
    ]
}

#[cfg(test)]
mod tests {
    use std::mem::{offset_of, size_of};

    use super::*;

    #[test]
    fn layout_matches_std140_block() {
        assert_eq!(size_of::<FrameUniforms>(), 256);
        assert_eq!(offset_of!(FrameUniforms, app_viewport), 0);
        assert_eq!(offset_of!(FrameUniforms, resolution), 16);
        assert_eq!(offset_of!(FrameUniforms, time), 28);
        assert_eq!(offset_of!(FrameUniforms, time_delta), 32);
        assert_eq!(offset_of!(FrameUniforms, frame_rate), 36);
        assert_eq!(offset_of!(FrameUniforms, frame), 40);
        assert_eq!(offset_of!(FrameUniforms, channel_time), 48);
        assert_eq!(offset_of!(FrameUniforms, channel_resolution), 112);
        assert_eq!(offset_of!(FrameUniforms, mouse), 176);
        assert_eq!(offset_of!(FrameUniforms, date), 192);
        assert_eq!(offset_of!(FrameUniforms, sample_rate), 208);
    }

    #[test]
    fn first_tick_starts_at_zero() {
        let mut clock = FrameClock::new();
        let first = clock.tick(Duration::from_millis(250));
        assert_eq!(first.time, 0.0);
        assert_eq!(first.frame, 0);
        assert_eq!(first.frame_rate, 0.0);

        let second = clock.tick(Duration::from_millis(20));
        assert_eq!(second.frame, 1);
        assert!((second.time - 0.02).abs() < 1e-6);
        assert!((second.frame_rate - 50.0).abs() < 1e-3);
    }

    #[test]
    fn reset_rewinds_time_and_frame() {
        let mut clock = FrameClock::new();
        for _ in 0..3 {
            clock.tick(Duration::from_millis(16));
        }
        clock.reset();
        assert_eq!(clock.frame(), 0);
        assert_eq!(clock.tick(Duration::from_millis(16)).time, 0.0);
    }

    #[test]
    fn sample_fills_every_channel_time() {
        let mut uniforms = FrameUniforms::new(640, 360);
        let sample = FrameSample {
            time: 2.5,
            delta: 0.016,
            frame_rate: 62.5,
            frame: 150,
            date: [2026.0, 9.0, 18.0, 3600.0],
        };
        uniforms.apply_sample(&sample);
        assert!(uniforms.channel_time.iter().all(|time| time[0] == 2.5));
        assert_eq!(uniforms.resolution, [640.0, 360.0, 1.0]);
        assert_eq!(uniforms.frame, 150);
        assert_eq!(uniforms.as_bytes().len(), 256);
    }
}
