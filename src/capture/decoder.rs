//! Transfer payload decoders producing 8-bit luma images

use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use super::frame::{StreamGeometry, TransferFormat, PROXY_BLOCK};
use crate::error::DecodeError;

/// Quantization values negotiated with the camera at open time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuantTable(pub Vec<u16>);

impl QuantTable {
    pub fn values(&self) -> &[u16] {
        &self.0
    }
}

/// Decode routines for one transfer format.
///
/// Implementations hold no per-frame state; every call is independent and
/// returns only after the target is fully written. On error the target may
/// hold partial output, so callers must never publish it.
pub trait FrameDecoder: Send + Sync {
    /// Decode the full-resolution image into `target`, laid out as `geometry`.
    /// `threads` bounds the number of worker threads used.
    fn decode_full(
        &self,
        payload: &[u8],
        target: &mut [u8],
        geometry: StreamGeometry,
        quant: &QuantTable,
        threads: usize,
    ) -> Result<(), DecodeError>;

    /// Decode the block-averaged proxy of an image whose full layout is
    /// `source` into `target`, laid out as `StreamGeometry::proxy(..)`.
    fn decode_proxy(
        &self,
        payload: &[u8],
        target: &mut [u8],
        source: StreamGeometry,
        quant: &QuantTable,
    ) -> Result<(), DecodeError>;
}

pub fn decoder_for(format: TransferFormat) -> Box<dyn FrameDecoder> {
    match format {
        TransferFormat::RawLuma => Box::new(RawLumaDecoder),
        TransferFormat::Mjpeg => Box::new(MjpegDecoder),
    }
}

fn check_target(target: &[u8], geometry: StreamGeometry) -> Result<(), DecodeError> {
    let expected = geometry.byte_len();
    if target.len() < expected {
        return Err(DecodeError::TargetTooSmall {
            expected,
            actual: target.len(),
        });
    }
    Ok(())
}

/// Run `f(first_row, band)` over horizontal bands of the image on up to
/// `threads` scoped workers.
fn for_each_band<F>(
    target: &mut [u8],
    geometry: StreamGeometry,
    threads: usize,
    f: F,
) -> Result<(), DecodeError>
where
    F: Fn(usize, &mut [u8]) + Sync,
{
    let stride = geometry.stride as usize;
    let height = geometry.height as usize;
    let image = &mut target[..stride * height];
    if image.is_empty() {
        return Ok(());
    }

    let threads = threads.clamp(1, height);
    if threads == 1 {
        f(0, image);
        return Ok(());
    }

    let rows_per_band = height.div_ceil(threads);
    crossbeam::scope(|scope| {
        for (i, band) in image.chunks_mut(rows_per_band * stride).enumerate() {
            let f = &f;
            scope.spawn(move |_| f(i * rows_per_band, band));
        }
    })
    .map_err(|_| DecodeError::UnsupportedLayout("decode worker panicked".into()))
}

/// Average each edge-clipped block of a `width × height` image read through
/// `pixel(x, y)`.
fn block_average<P>(target: &mut [u8], source: StreamGeometry, pixel: P)
where
    P: Fn(usize, usize) -> u8,
{
    let proxy = StreamGeometry::proxy(source.width, source.height);
    let block = PROXY_BLOCK as usize;
    let (width, height) = (source.width as usize, source.height as usize);

    for by in 0..proxy.height as usize {
        let y0 = by * block;
        let y1 = (y0 + block).min(height);
        for bx in 0..proxy.width as usize {
            let x0 = bx * block;
            let x1 = (x0 + block).min(width);
            let mut sum = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    sum += u32::from(pixel(x, y));
                }
            }
            let count = ((y1 - y0) * (x1 - x0)) as u32;
            target[by * proxy.stride as usize + bx] = (sum / count.max(1)) as u8;
        }
    }
}

/// Decoder for uncompressed transfers: `width * height` packed luma bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawLumaDecoder;

impl RawLumaDecoder {
    fn check_payload(payload: &[u8], source: StreamGeometry) -> Result<(), DecodeError> {
        let expected = source.width as usize * source.height as usize;
        if payload.len() < expected {
            return Err(DecodeError::PayloadTooShort {
                expected,
                actual: payload.len(),
            });
        }
        Ok(())
    }
}

impl FrameDecoder for RawLumaDecoder {
    fn decode_full(
        &self,
        payload: &[u8],
        target: &mut [u8],
        geometry: StreamGeometry,
        _quant: &QuantTable,
        threads: usize,
    ) -> Result<(), DecodeError> {
        Self::check_payload(payload, geometry)?;
        check_target(target, geometry)?;

        let width = geometry.width as usize;
        let stride = geometry.stride as usize;
        for_each_band(target, geometry, threads, |first_row, band| {
            for (k, row) in band.chunks_mut(stride).enumerate() {
                let start = (first_row + k) * width;
                row[..width].copy_from_slice(&payload[start..start + width]);
                row[width..].fill(0);
            }
        })
    }

    fn decode_proxy(
        &self,
        payload: &[u8],
        target: &mut [u8],
        source: StreamGeometry,
        _quant: &QuantTable,
    ) -> Result<(), DecodeError> {
        Self::check_payload(payload, source)?;
        check_target(target, StreamGeometry::proxy(source.width, source.height))?;

        let width = source.width as usize;
        block_average(target, source, |x, y| payload[y * width + x]);
        Ok(())
    }
}

/// Decoder for MJPEG transfers.
///
/// Colour images are reduced to BT.601 luma. The proxy path asks the JPEG
/// decoder for a 1/8 scaled IDCT, which only evaluates the DC coefficients.
#[derive(Debug, Default, Clone, Copy)]
pub struct MjpegDecoder;

fn bytes_per_pixel(format: JpegPixelFormat) -> Result<usize, DecodeError> {
    match format {
        JpegPixelFormat::L8 => Ok(1),
        JpegPixelFormat::RGB24 => Ok(3),
        other => Err(DecodeError::UnsupportedLayout(format!("{other:?}"))),
    }
}

#[inline]
fn luma(px: &[u8]) -> u8 {
    match px {
        [l] => *l,
        [r, g, b] => {
            ((77 * u32::from(*r) + 150 * u32::from(*g) + 29 * u32::from(*b) + 128) >> 8) as u8
        }
        _ => 0,
    }
}

fn check_dimensions(
    width: u32,
    height: u32,
    info: &jpeg_decoder::ImageInfo,
) -> Result<(), DecodeError> {
    if u32::from(info.width) != width || u32::from(info.height) != height {
        return Err(DecodeError::DimensionMismatch {
            width,
            height,
            actual_width: u32::from(info.width),
            actual_height: u32::from(info.height),
        });
    }
    Ok(())
}

impl FrameDecoder for MjpegDecoder {
    fn decode_full(
        &self,
        payload: &[u8],
        target: &mut [u8],
        geometry: StreamGeometry,
        _quant: &QuantTable,
        threads: usize,
    ) -> Result<(), DecodeError> {
        check_target(target, geometry)?;

        let mut decoder = Decoder::new(payload);
        let pixels = decoder.decode()?;
        let info = decoder
            .info()
            .ok_or_else(|| DecodeError::UnsupportedLayout("missing frame header".into()))?;
        check_dimensions(geometry.width, geometry.height, &info)?;
        let bpp = bytes_per_pixel(info.pixel_format)?;

        let width = geometry.width as usize;
        let stride = geometry.stride as usize;
        let src_row = width * bpp;
        for_each_band(target, geometry, threads, |first_row, band| {
            for (k, row) in band.chunks_mut(stride).enumerate() {
                let start = (first_row + k) * src_row;
                let src = &pixels[start..start + src_row];
                for (dst, px) in row[..width].iter_mut().zip(src.chunks_exact(bpp)) {
                    *dst = luma(px);
                }
                row[width..].fill(0);
            }
        })
    }

    fn decode_proxy(
        &self,
        payload: &[u8],
        target: &mut [u8],
        source: StreamGeometry,
        _quant: &QuantTable,
    ) -> Result<(), DecodeError> {
        let proxy = StreamGeometry::proxy(source.width, source.height);
        check_target(target, proxy)?;

        let mut decoder = Decoder::new(payload);
        decoder.read_info()?;
        let info = decoder
            .info()
            .ok_or_else(|| DecodeError::UnsupportedLayout("missing frame header".into()))?;
        check_dimensions(source.width, source.height, &info)?;
        let bpp = bytes_per_pixel(info.pixel_format)?;

        let (scaled_w, scaled_h) = decoder.scale(proxy.width as u16, proxy.height as u16)?;
        let pixels = decoder.decode()?;
        let (scaled_w, scaled_h) = (usize::from(scaled_w).max(1), usize::from(scaled_h).max(1));

        // The scaled IDCT may round differently at the edges; clamp into it.
        for y in 0..proxy.height as usize {
            let sy = y.min(scaled_h - 1);
            for x in 0..proxy.width as usize {
                let sx = x.min(scaled_w - 1);
                let at = (sy * scaled_w + sx) * bpp;
                target[y * proxy.stride as usize + x] =
                    pixels.get(at..at + bpp).map(luma).unwrap_or(0);
            }
        }
        Ok(())
    }
}
