//! Frame pipeline (component D): format-change detection, damage rects,
//! truncation handling, and the DMA-buf fd cache.
//!
//! The DMA cache follows the same bounded, eviction-on-overflow shape as
//! this workspace's `scanner::cache::ScanCache` (a hash map plus an
//! insertion-order queue for eviction), keyed by the frame message's slot
//! offset within the shared region rather than by descriptor pointer
//! identity — pointer identity is not meaningful once the region is mapped
//! independently per task, but the slot offset is stable and safe to use as
//! a key (see DESIGN.md's note on this).

use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use rustc_hash::FxHashMap;
use thiserror::Error;

use lgmp::acquire::ShmRegion;
use lgmp::wire::{FrameDescriptor, FrameFlags, FrameRotation, FrameType};

use crate::metrics as m;
use crate::sink::{Cap, DisplaySink, FramePayload, FrameFormat, FrameSink};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown frame type {0}")]
    UnknownFormat(u32),
    #[error("frame truncated; host region should be at least {recommended_mib} MiB")]
    Truncated { recommended_mib: u64 },
    #[error("malformed frame descriptor or out-of-range pixel data")]
    Malformed,
    #[error("dma-buf fd request failed, falling back to copy path: {0}")]
    DmaTransient(#[from] lgmp::AcquireError),
}

const MAX_DMA_CACHE_ENTRIES: usize = 8;

struct CachedDma {
    fd: OwnedFd,
    size: u64,
}

/// Next power-of-two MiB >= `(screen_h * pitch * 2 / 1 MiB) + 10`, the
/// recommended minimum region size reported on a truncated frame.
fn recommended_region_mib(screen_h: u32, pitch: u32) -> u64 {
    const MIB: u64 = 1024 * 1024;
    let estimate = (screen_h as u64 * pitch as u64 * 2 / MIB) + 10;
    estimate.next_power_of_two()
}

pub struct FramePipeline {
    last_format_ver: Option<u32>,
    last_frame_serial: Option<u32>,
    dma_cache: FxHashMap<u64, CachedDma>,
    dma_order: VecDeque<u64>,
    screensaver_blocked: bool,
}

impl Default for FramePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePipeline {
    pub fn new() -> Self {
        Self {
            last_format_ver: None,
            last_frame_serial: None,
            dma_cache: FxHashMap::default(),
            dma_order: VecDeque::new(),
            screensaver_blocked: false,
        }
    }

    fn dma_lookup_or_insert(
        &mut self,
        region: &ShmRegion,
        key: u64,
        offset: u64,
        size: u64,
    ) -> Result<BorrowedFd<'_>, FrameError> {
        let needs_fetch = match self.dma_cache.get(&key) {
            Some(entry) if entry.size >= size => {
                metrics::counter!(m::DMA_CACHE_HITS).increment(1);
                false
            }
            Some(_) => {
                self.dma_cache.remove(&key);
                self.dma_order.retain(|k| *k != key);
                true
            }
            None => true,
        };

        if needs_fetch {
            metrics::counter!(m::DMA_CACHE_MISSES).increment(1);
            let fd = region.dma_fd(offset, size)?;
            self.dma_cache.insert(key, CachedDma { fd, size });
            self.dma_order.push_back(key);
            if self.dma_order.len() > MAX_DMA_CACHE_ENTRIES {
                if let Some(oldest) = self.dma_order.pop_front() {
                    self.dma_cache.remove(&oldest);
                    metrics::counter!(m::DMA_CACHE_EVICTIONS).increment(1);
                }
            }
        }

        Ok(self.dma_cache.get(&key).unwrap().fd.as_fd())
    }

    /// Process one FRAME message. `slot_offset` is the payload's absolute
    /// byte offset within `region`, used both for DMA bounds arithmetic and
    /// as the DMA cache key.
    pub fn process(
        &mut self,
        region: &ShmRegion,
        payload: &[u8],
        slot_offset: u64,
        sink: &mut dyn FrameSink,
        display: &dyn DisplaySink,
    ) -> Result<(), FrameError> {
        let desc = FrameDescriptor::decode(payload).ok_or(FrameError::Malformed)?;

        if self.last_frame_serial == Some(desc.frame_serial) {
            metrics::counter!(m::FRAMES_DEDUPED).increment(1);
            return Ok(());
        }

        let frame_type =
            FrameType::from_wire(desc.frame_type_raw).ok_or(FrameError::UnknownFormat(desc.frame_type_raw))?;
        let rotation = FrameRotation::from_wire(desc.rotation_raw).unwrap_or(FrameRotation::Deg0);

        if self.last_format_ver != Some(desc.format_ver) {
            sink.on_format(FrameFormat {
                format_ver: desc.format_ver,
                frame_type,
                width: desc.frame_w,
                height: desc.frame_h,
                bpp: frame_type.bits_per_pixel(),
                pitch: desc.pitch,
                rotation,
            });
            self.last_format_ver = Some(desc.format_ver);
            metrics::counter!(m::FORMAT_CHANGES).increment(1);
        }

        if desc.flags.truncated() {
            let recommended_mib = recommended_region_mib(desc.screen_h, desc.pitch);
            log::warn!(
                "frame truncated; host region should be at least {recommended_mib} MiB, continuing with partial frame"
            );
            metrics::counter!(m::FRAMES_TRUNCATED).increment(1);
        }

        self.handle_display_flags(desc.flags, display);

        let pixel_local_offset = desc.offset as usize;
        let pixel_size = desc.frame_h as u64 * desc.pitch as u64;
        let pixel_end = pixel_local_offset
            .checked_add(pixel_size as usize)
            .ok_or(FrameError::Malformed)?;
        if pixel_end > payload.len() {
            return Err(FrameError::Malformed);
        }

        let damage_rects: &[lgmp::wire::DamageRect] = if rects_in_bounds(&desc) {
            &desc.damage_rects
        } else {
            &[]
        };

        if region.dma_capable() && sink.supports(Cap::Dmabuf) {
            let pixel_offset = slot_offset + pixel_local_offset as u64;
            match self.dma_lookup_or_insert(region, slot_offset, pixel_offset, pixel_size) {
                Ok(fd) => {
                    sink.on_frame(FramePayload::DmaBuf(fd), damage_rects);
                    self.last_frame_serial = Some(desc.frame_serial);
                    metrics::counter!(m::FRAMES_DELIVERED).increment(1);
                    return Ok(());
                }
                Err(FrameError::DmaTransient(e)) => {
                    log::warn!("dma-buf fd request failed, using copy path: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        let pixels = &payload[pixel_local_offset..pixel_end];
        sink.on_frame(FramePayload::Bytes(pixels), damage_rects);
        self.last_frame_serial = Some(desc.frame_serial);
        metrics::counter!(m::FRAMES_DELIVERED).increment(1);
        Ok(())
    }

    /// Whether at least one `on_format` callback has fired this session.
    pub fn has_format(&self) -> bool {
        self.last_format_ver.is_some()
    }

    fn handle_display_flags(&mut self, flags: FrameFlags, display: &dyn DisplaySink) {
        if flags.request_activation() {
            display.request_activation();
        }
        let block = flags.block_screensaver();
        if block != self.screensaver_blocked {
            display.inhibit_idle(block);
            self.screensaver_blocked = block;
        }
    }
}

fn rects_in_bounds(desc: &FrameDescriptor) -> bool {
    desc.damage_rects.iter().all(|r| {
        r.x.checked_add(r.w).is_some_and(|right| right <= desc.frame_w)
            && r.y.checked_add(r.h).is_some_and(|bottom| bottom <= desc.frame_h)
    })
}
