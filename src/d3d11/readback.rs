// GPU texture → host-memory pixel buffer.

use windows::Win32::Graphics::Direct3D11::{
    ID3D11Texture2D, D3D11_CPU_ACCESS_READ, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ,
    D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};

use crate::d3d11::GpuContext;
use crate::error::{CaptureError, ErrorKind, Result};

/// CPU-side pixels of one captured frame.
///
/// `data` is tightly packed, row-major, 3 bytes per pixel in **B, G, R**
/// order: the device-native BGRA layout with the alpha byte stripped.
#[derive(Debug, Clone)]
pub struct FramePixels {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Copy a GPU texture into host memory, dropping the alpha channel.
///
/// Allocates a CPU-readable staging sibling of `source`, copies on the
/// shared immediate context, then maps it and packs exactly
/// `width × height × 3` bytes. Row-pitch padding never reaches the output.
/// Callers must not hold the ring lock across this call.
pub(crate) fn read_texture(gpu: &GpuContext, source: &ID3D11Texture2D) -> Result<FramePixels> {
    let mut desc = D3D11_TEXTURE2D_DESC::default();
    // SAFETY: GetDesc writes the descriptor of a live texture.
    unsafe { source.GetDesc(&mut desc) };

    let staging_desc = D3D11_TEXTURE2D_DESC {
        Usage: D3D11_USAGE_STAGING,
        BindFlags: 0,
        CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
        MiscFlags: 0,
        ..desc
    };

    // SAFETY: descriptor is fully initialized; the out-param is written on
    // success and the returned texture is COM-owned.
    let staging = unsafe {
        let mut staging = None;
        gpu.device
            .CreateTexture2D(&staging_desc, None, Some(&mut staging))
            .map_err(|e| {
                CaptureError::from_win32(
                    ErrorKind::StagingAllocFailed,
                    "failed to create the readback staging texture",
                    e,
                )
            })?;
        staging.ok_or_else(|| {
            CaptureError::new(
                ErrorKind::StagingAllocFailed,
                "CreateTexture2D returned no staging texture",
            )
        })?
    };

    let width = desc.Width as usize;
    let height = desc.Height as usize;
    let stride = width * 3;
    let mut data = vec![0u8; stride * height];

    // SAFETY: both textures are live; Map exposes RowPitch-strided memory
    // valid until the matching Unmap. Every read below stays inside
    // `height` rows of that mapping, every write inside `data`. No fallible
    // operation sits between the successful Map and the Unmap.
    unsafe {
        gpu.context.CopyResource(&staging, source);

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        gpu.context
            .Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
            .map_err(|e| {
                CaptureError::from_win32(
                    ErrorKind::MapFailed,
                    "failed to map the readback staging texture",
                    e,
                )
            })?;

        let source_base = mapped.pData as *const u8;
        for y in 0..height {
            let source_row = source_base.add(y * mapped.RowPitch as usize);
            let target_row = &mut data[y * stride..(y + 1) * stride];
            for x in 0..width {
                // Keep B, G, R; skip the alpha byte.
                let pixel = std::slice::from_raw_parts(source_row.add(x * 4), 3);
                target_row[x * 3..x * 3 + 3].copy_from_slice(pixel);
            }
        }

        gpu.context.Unmap(&staging, 0);
    }

    Ok(FramePixels {
        width: desc.Width,
        height: desc.Height,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::d3d11;
    use windows::Win32::Graphics::Direct3D11::{D3D11_SUBRESOURCE_DATA, D3D11_USAGE_DEFAULT};
    use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};

    fn make_bgra_texture(
        gpu: &GpuContext,
        width: u32,
        height: u32,
        bytes: &[u8],
    ) -> ID3D11Texture2D {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: 0,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let initial = D3D11_SUBRESOURCE_DATA {
            pSysMem: bytes.as_ptr() as *const _,
            SysMemPitch: width * 4,
            SysMemSlicePitch: 0,
        };
        unsafe {
            let mut texture = None;
            gpu.device
                .CreateTexture2D(&desc, Some(&initial), Some(&mut texture))
                .expect("create source texture");
            texture.unwrap()
        }
    }

    #[test]
    #[ignore = "requires a hardware Direct3D 11 device"]
    fn readback_strips_alpha() {
        let gpu = d3d11::acquire().expect("device");

        // 2x1 BGRA with known bytes; alpha 0xFF and 0x00 must both vanish.
        let source = make_bgra_texture(
            &gpu,
            2,
            1,
            &[0x11, 0x22, 0x33, 0xFF, 0x44, 0x55, 0x66, 0x00],
        );

        let pixels = read_texture(&gpu, &source).expect("readback");
        assert_eq!(pixels.width, 2);
        assert_eq!(pixels.height, 1);
        assert_eq!(pixels.data, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    }

    #[test]
    #[ignore = "requires a hardware Direct3D 11 device"]
    fn readback_is_tightly_packed() {
        let gpu = d3d11::acquire().expect("device");

        // 3x2: width*4 = 12 bytes per row, almost certainly padded by the
        // driver once staged; the output must still be exactly w*h*3.
        let mut bytes = Vec::new();
        for i in 0..6u8 {
            bytes.extend_from_slice(&[i, i + 100, i + 200, 0xFF]);
        }
        let source = make_bgra_texture(&gpu, 3, 2, &bytes);

        let pixels = read_texture(&gpu, &source).expect("readback");
        assert_eq!(pixels.data.len(), 3 * 2 * 3);
        // Pixel (x, y) lands at 3*x + 9*y.
        assert_eq!(pixels.data[0], 0);
        assert_eq!(pixels.data[3], 1);
        assert_eq!(pixels.data[9], 3);
        assert_eq!(pixels.data[10], 103);
    }
}
