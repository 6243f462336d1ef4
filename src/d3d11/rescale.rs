// GPU texture rescale via a fullscreen-triangle render pass.
//
// Used when `max_width` / `max_height` cap the stored frame size. A single
// triangle covering clip space samples the source with a linear-clamp
// sampler into a render target of the requested size. Shaders compile once
// per engine, on first use.

use windows::core::PCSTR;
use windows::Win32::Graphics::Direct3D::Fxc::{D3DCompile, D3DCOMPILE_OPTIMIZATION_LEVEL3};
use windows::Win32::Graphics::Direct3D::{ID3DBlob, D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST};
use windows::Win32::Graphics::Direct3D11::{
    ID3D11PixelShader, ID3D11RenderTargetView, ID3D11SamplerState, ID3D11ShaderResourceView,
    ID3D11Texture2D, ID3D11VertexShader, D3D11_BIND_RENDER_TARGET, D3D11_BIND_SHADER_RESOURCE,
    D3D11_COMPARISON_NEVER, D3D11_FILTER_MIN_MAG_MIP_LINEAR, D3D11_SAMPLER_DESC,
    D3D11_TEXTURE2D_DESC, D3D11_TEXTURE_ADDRESS_CLAMP, D3D11_USAGE_DEFAULT, D3D11_VIEWPORT,
};
use windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC;

use crate::d3d11::GpuContext;
use crate::error::{CaptureError, ErrorKind, Result};

/// Three vertices generated from SV_VertexID cover the whole clip space.
const FULLSCREEN_VS: &str = r#"
struct VSOutput
{
    float4 position : SV_POSITION;
    float2 uv       : TEXCOORD0;
};

VSOutput main(uint vertexId : SV_VertexID)
{
    VSOutput o;

    float2 pos;
    float2 uv;
    if (vertexId == 0)
    {
        pos = float2(-1.0f, -1.0f);
        uv  = float2(0.0f, 1.0f);
    }
    else if (vertexId == 1)
    {
        pos = float2(-1.0f, 3.0f);
        uv  = float2(0.0f, -1.0f);
    }
    else
    {
        pos = float2(3.0f, -1.0f);
        uv  = float2(2.0f, 1.0f);
    }

    o.position = float4(pos, 0.0f, 1.0f);
    o.uv       = uv;
    return o;
}
"#;

const SAMPLE_PS: &str = r#"
struct VSOutput
{
    float4 position : SV_POSITION;
    float2 uv       : TEXCOORD0;
};

Texture2D    SourceTex   : register(t0);
SamplerState LinearClamp : register(s0);

float4 main(VSOutput input) : SV_TARGET
{
    return SourceTex.Sample(LinearClamp, input.uv);
}
"#;

/// Compiled rescale pass, reusing the shared device and immediate context.
pub(crate) struct TextureRescaler {
    vertex_shader: ID3D11VertexShader,
    pixel_shader: ID3D11PixelShader,
    sampler: ID3D11SamplerState,
}

impl TextureRescaler {
    pub fn new(gpu: &GpuContext) -> Result<Self> {
        let vs_bytecode = compile_shader(FULLSCREEN_VS, "main", b"vs_5_0\0")?;
        let ps_bytecode = compile_shader(SAMPLE_PS, "main", b"ps_5_0\0")?;

        // SAFETY: bytecode blobs come straight from D3DCompile; out-params
        // are written on success.
        let (vertex_shader, pixel_shader) = unsafe {
            let mut vertex_shader = None;
            gpu.device
                .CreateVertexShader(blob_bytes(&vs_bytecode), None, Some(&mut vertex_shader))
                .map_err(|e| {
                    CaptureError::from_win32(
                        ErrorKind::GpuInitFailed,
                        "failed to create the rescale vertex shader",
                        e,
                    )
                })?;

            let mut pixel_shader = None;
            gpu.device
                .CreatePixelShader(blob_bytes(&ps_bytecode), None, Some(&mut pixel_shader))
                .map_err(|e| {
                    CaptureError::from_win32(
                        ErrorKind::GpuInitFailed,
                        "failed to create the rescale pixel shader",
                        e,
                    )
                })?;

            (
                vertex_shader.ok_or_else(|| {
                    CaptureError::new(ErrorKind::GpuInitFailed, "CreateVertexShader returned nothing")
                })?,
                pixel_shader.ok_or_else(|| {
                    CaptureError::new(ErrorKind::GpuInitFailed, "CreatePixelShader returned nothing")
                })?,
            )
        };

        let sampler_desc = D3D11_SAMPLER_DESC {
            Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
            AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
            MipLODBias: 0.0,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D11_COMPARISON_NEVER,
            BorderColor: [0.0; 4],
            MinLOD: 0.0,
            MaxLOD: f32::MAX,
        };
        // SAFETY: descriptor fully initialized; out-param written on success.
        let sampler = unsafe {
            let mut sampler = None;
            gpu.device
                .CreateSamplerState(&sampler_desc, Some(&mut sampler))
                .map_err(|e| {
                    CaptureError::from_win32(
                        ErrorKind::GpuInitFailed,
                        "failed to create the rescale sampler",
                        e,
                    )
                })?;
            sampler.ok_or_else(|| {
                CaptureError::new(ErrorKind::GpuInitFailed, "CreateSamplerState returned nothing")
            })?
        };

        Ok(Self {
            vertex_shader,
            pixel_shader,
            sampler,
        })
    }

    /// Render `source` into a fresh texture of the requested size.
    ///
    /// Preserves the source format; callers never request an upscale.
    pub fn rescale(
        &self,
        gpu: &GpuContext,
        source: &ID3D11Texture2D,
        width: u32,
        height: u32,
    ) -> Result<ID3D11Texture2D> {
        let mut source_desc = D3D11_TEXTURE2D_DESC::default();
        // SAFETY: GetDesc writes the descriptor of a live texture.
        unsafe { source.GetDesc(&mut source_desc) };

        let target_desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: source_desc.Format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_RENDER_TARGET.0 as u32 | D3D11_BIND_SHADER_RESOURCE.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };

        // SAFETY: descriptor fully initialized; out-params written on success.
        let (target, render_target) = unsafe {
            let mut target = None;
            gpu.device
                .CreateTexture2D(&target_desc, None, Some(&mut target))
                .map_err(|e| {
                    CaptureError::from_win32(
                        ErrorKind::GpuInitFailed,
                        "failed to allocate the rescale target texture",
                        e,
                    )
                })?;
            let target = target.ok_or_else(|| {
                CaptureError::new(ErrorKind::GpuInitFailed, "CreateTexture2D returned nothing")
            })?;

            let mut render_target: Option<ID3D11RenderTargetView> = None;
            gpu.device
                .CreateRenderTargetView(&target, None, Some(&mut render_target))
                .map_err(|e| {
                    CaptureError::from_win32(
                        ErrorKind::GpuInitFailed,
                        "failed to create the rescale render target view",
                        e,
                    )
                })?;
            let render_target = render_target.ok_or_else(|| {
                CaptureError::new(
                    ErrorKind::GpuInitFailed,
                    "CreateRenderTargetView returned nothing",
                )
            })?;
            (target, render_target)
        };

        // SAFETY: source is a live texture with shader-resource binding
        // (frame-pool back buffers carry it).
        let source_view: ID3D11ShaderResourceView = unsafe {
            let mut view = None;
            gpu.device
                .CreateShaderResourceView(source, None, Some(&mut view))
                .map_err(|e| {
                    CaptureError::from_win32(
                        ErrorKind::GpuInitFailed,
                        "failed to create the rescale source view",
                        e,
                    )
                })?;
            view.ok_or_else(|| {
                CaptureError::new(
                    ErrorKind::GpuInitFailed,
                    "CreateShaderResourceView returned nothing",
                )
            })?
        };

        let viewport = D3D11_VIEWPORT {
            TopLeftX: 0.0,
            TopLeftY: 0.0,
            Width: width as f32,
            Height: height as f32,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };

        // SAFETY: bind → draw → unbind on live COM objects. Everything is
        // unbound afterwards so readbacks sharing the immediate context see
        // no lingering hazards.
        unsafe {
            let context = &gpu.context;
            context.OMSetRenderTargets(Some(&[Some(render_target.clone())]), None);
            context.RSSetViewports(Some(&[viewport]));
            context.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            context.IASetInputLayout(None);
            context.VSSetShader(&self.vertex_shader, None);
            context.PSSetShader(&self.pixel_shader, None);
            context.PSSetShaderResources(0, Some(&[Some(source_view.clone())]));
            context.PSSetSamplers(0, Some(&[Some(self.sampler.clone())]));

            context.Draw(3, 0);

            context.PSSetShaderResources(0, Some(&[None]));
            context.PSSetSamplers(0, Some(&[None]));
            context.OMSetRenderTargets(None, None);
            context.VSSetShader(None, None);
            context.PSSetShader(None, None);
        }

        Ok(target)
    }
}

fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    // SAFETY: the blob owns its buffer for its whole lifetime.
    unsafe { std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()) }
}

fn compile_shader(source: &str, entry_point: &str, target: &[u8]) -> Result<ID3DBlob> {
    let mut blob: Option<ID3DBlob> = None;
    let mut error_blob: Option<ID3DBlob> = None;

    let entry = format!("{entry_point}\0");

    // SAFETY: D3DCompile reads the source slice and writes COM blobs; all
    // pointers are valid for the duration of the call.
    let compiled = unsafe {
        D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            None,
            None,
            None,
            PCSTR(entry.as_ptr()),
            PCSTR(target.as_ptr()),
            D3DCOMPILE_OPTIMIZATION_LEVEL3,
            0,
            &mut blob,
            Some(&mut error_blob),
        )
    };

    if let Err(e) = compiled {
        let message = error_blob
            .as_ref()
            .map(|b| String::from_utf8_lossy(blob_bytes(b)).trim_end_matches('\0').to_string())
            .unwrap_or_else(|| e.message());
        return Err(CaptureError::from_win32(
            ErrorKind::GpuInitFailed,
            format!("rescale shader compilation failed: {message}"),
            e,
        ));
    }

    blob.ok_or_else(|| {
        CaptureError::new(
            ErrorKind::GpuInitFailed,
            "D3DCompile succeeded but returned no bytecode",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::d3d11;
    use crate::d3d11::readback::read_texture;
    use windows::Win32::Graphics::Direct3D11::D3D11_SUBRESOURCE_DATA;
    use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM;

    #[test]
    #[ignore = "requires a hardware Direct3D 11 device"]
    fn rescale_halves_a_solid_texture() {
        let gpu = d3d11::acquire().expect("device");
        let rescaler = TextureRescaler::new(&gpu).expect("shader setup");

        // 4x2 solid colour source.
        let pixel = [0x10u8, 0x80, 0xF0, 0xFF];
        let bytes: Vec<u8> = pixel.iter().copied().cycle().take(4 * 2 * 4).collect();
        let desc = D3D11_TEXTURE2D_DESC {
            Width: 4,
            Height: 2,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let initial = D3D11_SUBRESOURCE_DATA {
            pSysMem: bytes.as_ptr() as *const _,
            SysMemPitch: 16,
            SysMemSlicePitch: 0,
        };
        let source = unsafe {
            let mut texture = None;
            gpu.device
                .CreateTexture2D(&desc, Some(&initial), Some(&mut texture))
                .expect("create source");
            texture.unwrap()
        };

        let scaled = rescaler.rescale(&gpu, &source, 2, 1).expect("rescale");
        let pixels = read_texture(&gpu, &scaled).expect("readback");

        assert_eq!((pixels.width, pixels.height), (2, 1));
        // Solid input stays solid through linear sampling.
        assert_eq!(pixels.data, [0x10, 0x80, 0xF0, 0x10, 0x80, 0xF0]);
    }
}
