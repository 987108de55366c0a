// SPDX-License-Identifier: LGPL-3.0-or-later OR MPL-2.0
// This file is a part of `tessera`.
//
// `tessera` is free software: you can redistribute it and/or modify it under the terms of
// either:
//
// * GNU Lesser General Public License as published by the Free Software Foundation, either
// version 3 of the License, or (at your option) any later version.
// * Mozilla Public License as published by the Mozilla Foundation, version 2.
//
// `tessera` is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Lesser General Public License or the Mozilla Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License and the Mozilla
// Public License along with `tessera`. If not, see <https://www.gnu.org/licenses/> or
// <https://www.mozilla.org/en-US/MPL/2.0/>.

//! A software `GpuContext` for the tests: textures are CPU pixel buffers
//! and triangle draws are rasterized with nearest sampling.

use crate::color::ColorM;
use crate::gpu_backend::{Address, CompositeMode, Filter, GpuContext, VERTEX_FLOAT_COUNT};
use crate::Region;

use hashbrown::HashMap;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

#[derive(Debug)]
pub(crate) struct SoftError(pub(crate) String);

impl fmt::Display for SoftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SoftError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TexHandle {
    id: usize,
}

struct TextureData {
    width: i32,
    height: i32,
    pixels: Vec<u8>,
}

struct SoftState {
    textures: HashMap<usize, TextureData>,
    next_id: usize,
    invalidated: bool,
}

/// Clones share the same underlying state, so a test can keep a handle to
/// the driver it hands to a context.
#[derive(Clone)]
pub(crate) struct SoftGpu {
    state: Rc<RefCell<SoftState>>,
    restorable: bool,
}

impl SoftGpu {
    pub(crate) fn new() -> Self {
        Self::with_restoring(true)
    }

    /// A driver whose textures never get lost, like a desktop GL context
    /// that keeps its resources across frames.
    pub(crate) fn without_restoring() -> Self {
        Self::with_restoring(false)
    }

    fn with_restoring(restorable: bool) -> Self {
        SoftGpu {
            state: Rc::new(RefCell::new(SoftState {
                textures: HashMap::new(),
                next_id: 1,
                invalidated: false,
            })),
            restorable,
        }
    }

    /// Simulate a device loss: textures report invalidated and their
    /// contents are gone once the state is reset.
    pub(crate) fn lose_context(&self) {
        self.state.borrow_mut().invalidated = true;
    }
}

impl GpuContext for SoftGpu {
    type Texture = TexHandle;
    type Error = SoftError;

    fn new_texture(&self, width: i32, height: i32) -> Result<TexHandle, SoftError> {
        if width <= 0 || height <= 0 || width > self.max_texture_size() || height > self.max_texture_size() {
            return Err(SoftError(format!("bad texture size {width}x{height}")));
        }
        let mut st = self.state.borrow_mut();
        let id = st.next_id;
        st.next_id += 1;
        st.textures.insert(
            id,
            TextureData {
                width,
                height,
                pixels: vec![0; 4 * (width * height) as usize],
            },
        );
        Ok(TexHandle { id })
    }

    fn new_screen_framebuffer_texture(
        &self,
        width: i32,
        height: i32,
    ) -> Result<TexHandle, SoftError> {
        self.new_texture(width, height)
    }

    fn replace_pixels(&self, texture: &TexHandle, pixels: Option<&[u8]>, region: Region) {
        let mut st = self.state.borrow_mut();
        let tex = st.textures.get_mut(&texture.id).expect("unknown texture");
        let (rw, rh) = (region.width(), region.height());
        for row in 0..rh {
            let y = region.min.y + row;
            if y < 0 || y >= tex.height {
                continue;
            }
            for col in 0..rw {
                let x = region.min.x + col;
                if x < 0 || x >= tex.width {
                    continue;
                }
                let dst = 4 * (y * tex.width + x) as usize;
                match pixels {
                    Some(p) => {
                        let src = 4 * (row * rw + col) as usize;
                        tex.pixels[dst..dst + 4].copy_from_slice(&p[src..src + 4]);
                    }
                    None => tex.pixels[dst..dst + 4].fill(0),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_triangles(
        &self,
        target: &TexHandle,
        source: &TexHandle,
        vertices: &[f32],
        indices: &[u16],
        color_matrix: Option<&ColorM>,
        mode: CompositeMode,
        _filter: Filter,
        address: Address,
    ) {
        let mut st = self.state.borrow_mut();
        let (src_w, src_h, src_pixels) = {
            let src = st.textures.get(&source.id).expect("unknown source texture");
            (src.width, src.height, src.pixels.clone())
        };
        let tex = st.textures.get_mut(&target.id).expect("unknown target texture");
        let (tw, th) = (tex.width, tex.height);

        // Each pixel is composited at most once per draw, as a GPU would.
        let mut covered = vec![false; (tw * th) as usize];

        let vertex = |i: u16| -> [f32; VERTEX_FLOAT_COUNT] {
            let base = i as usize * VERTEX_FLOAT_COUNT;
            let mut v = [0.0; VERTEX_FLOAT_COUNT];
            v.copy_from_slice(&vertices[base..base + VERTEX_FLOAT_COUNT]);
            v
        };

        for tri in indices.chunks(3) {
            let (v0, v1, v2) = (vertex(tri[0]), vertex(tri[1]), vertex(tri[2]));
            let (x0, y0) = (v0[0], v0[1]);
            let (x1, y1) = (v1[0], v1[1]);
            let (x2, y2) = (v2[0], v2[1]);

            let denom = (y1 - y2) * (x0 - x2) + (x2 - x1) * (y0 - y2);
            if denom == 0.0 {
                continue;
            }

            let min_x = x0.min(x1).min(x2).floor().max(0.0) as i32;
            let max_x = (x0.max(x1).max(x2).ceil() as i32).min(tw);
            let min_y = y0.min(y1).min(y2).floor().max(0.0) as i32;
            let max_y = (y0.max(y1).max(y2).ceil() as i32).min(th);

            for py in min_y..max_y {
                for px in min_x..max_x {
                    let (cx, cy) = (px as f32 + 0.5, py as f32 + 0.5);
                    let l0 = ((y1 - y2) * (cx - x2) + (x2 - x1) * (cy - y2)) / denom;
                    let l1 = ((y2 - y0) * (cx - x2) + (x0 - x2) * (cy - y2)) / denom;
                    let l2 = 1.0 - l0 - l1;
                    const EPS: f32 = 1e-6;
                    if l0 < -EPS || l1 < -EPS || l2 < -EPS {
                        continue;
                    }
                    let idx = (py * tw + px) as usize;
                    if covered[idx] {
                        continue;
                    }
                    covered[idx] = true;

                    let lerp = |k: usize| l0 * v0[k] + l1 * v1[k] + l2 * v2[k];
                    let sx = lerp(2);
                    let sy = lerp(3);
                    let bounds = [v0[4], v0[5], v0[6], v0[7]];
                    let color = [lerp(8), lerp(9), lerp(10), lerp(11)];

                    let src =
                        sample(&src_pixels, src_w, src_h, sx, sy, bounds, address);
                    let src = shade(src, color, color_matrix);

                    let dst_idx = 4 * idx;
                    let dst = [
                        tex.pixels[dst_idx] as f32 / 255.0,
                        tex.pixels[dst_idx + 1] as f32 / 255.0,
                        tex.pixels[dst_idx + 2] as f32 / 255.0,
                        tex.pixels[dst_idx + 3] as f32 / 255.0,
                    ];
                    let out = composite(src, dst, mode);
                    for (k, v) in out.iter().enumerate() {
                        tex.pixels[dst_idx + k] = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                    }
                }
            }
        }
    }

    fn pixels(&self, texture: &TexHandle) -> Result<Vec<u8>, SoftError> {
        let st = self.state.borrow();
        st.textures
            .get(&texture.id)
            .map(|t| t.pixels.clone())
            .ok_or_else(|| SoftError("unknown texture".into()))
    }

    fn delete_texture(&self, texture: TexHandle) {
        self.state.borrow_mut().textures.remove(&texture.id);
    }

    fn is_invalidated(&self, _texture: &TexHandle) -> bool {
        self.state.borrow().invalidated
    }

    fn flush(&self) {}

    fn max_texture_size(&self) -> i32 {
        4096
    }

    fn has_high_precision_float(&self) -> bool {
        true
    }

    fn needs_restoring(&self) -> bool {
        self.restorable
    }

    fn reset_state(&self) -> Result<(), SoftError> {
        // Device loss wipes texture contents; anything not rebuilt by the
        // restore pass reads back as zero.
        let mut st = self.state.borrow_mut();
        for tex in st.textures.values_mut() {
            tex.pixels.fill(0);
        }
        st.invalidated = false;
        Ok(())
    }
}

/// Premultiplied RGBA of the source texel at `(sx, sy)`, honoring the
/// per-vertex source bounds and the address mode.
fn sample(
    pixels: &[u8],
    width: i32,
    height: i32,
    sx: f32,
    sy: f32,
    bounds: [f32; 4],
    address: Address,
) -> [f32; 4] {
    let [bx0, by0, bx1, by1] = bounds;
    let (mut sx, mut sy) = (sx, sy);
    match address {
        Address::ClampToZero => {
            if sx < bx0 || sy < by0 || sx >= bx1 || sy >= by1 {
                return [0.0; 4];
            }
        }
        Address::Repeat => {
            if bx1 > bx0 {
                sx = bx0 + (sx - bx0).rem_euclid(bx1 - bx0);
            }
            if by1 > by0 {
                sy = by0 + (sy - by0).rem_euclid(by1 - by0);
            }
        }
    }
    let x = (sx.floor() as i32).clamp(0, width - 1);
    let y = (sy.floor() as i32).clamp(0, height - 1);
    let idx = 4 * (y * width + x) as usize;
    [
        pixels[idx] as f32 / 255.0,
        pixels[idx + 1] as f32 / 255.0,
        pixels[idx + 2] as f32 / 255.0,
        pixels[idx + 3] as f32 / 255.0,
    ]
}

/// Apply the color matrix (over straight alpha) and the vertex color scale
/// (over premultiplied alpha) to a premultiplied texel.
fn shade(texel: [f32; 4], scale: [f32; 4], color_matrix: Option<&ColorM>) -> [f32; 4] {
    let mut p = texel;
    if let Some(m) = color_matrix {
        let a = p[3];
        let straight = if a > 0.0 {
            [p[0] / a, p[1] / a, p[2] / a, a]
        } else {
            [0.0, 0.0, 0.0, 0.0]
        };
        let out = m.apply(straight);
        p = [out[0] * out[3], out[1] * out[3], out[2] * out[3], out[3]];
    }
    let [cr, cg, cb, ca] = scale;
    [p[0] * cr * ca, p[1] * cg * ca, p[2] * cb * ca, p[3] * ca]
}

fn composite(src: [f32; 4], dst: [f32; 4], mode: CompositeMode) -> [f32; 4] {
    use CompositeMode::*;
    let (sa, da) = (src[3], dst[3]);
    // Porter-Duff blend factors over premultiplied colors.
    let (sf, df) = match mode {
        SourceOver => (1.0, 1.0 - sa),
        Clear => (0.0, 0.0),
        Copy => (1.0, 0.0),
        Destination => (0.0, 1.0),
        DestinationOver => (1.0 - da, 1.0),
        SourceIn => (da, 0.0),
        DestinationIn => (0.0, sa),
        SourceOut => (1.0 - da, 0.0),
        DestinationOut => (0.0, 1.0 - sa),
        SourceAtop => (da, 1.0 - sa),
        DestinationAtop => (1.0 - da, sa),
        Xor => (1.0 - da, 1.0 - sa),
        Lighter => (1.0, 1.0),
    };
    [
        src[0] * sf + dst[0] * df,
        src[1] * sf + dst[1] * df,
        src[2] * sf + dst[2] * df,
        src[3] * sf + dst[3] * df,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_backend::{put_quad_vertices, QUAD_INDICES};
    use crate::region;

    #[test]
    fn quad_copy_is_exact() {
        let gpu = SoftGpu::new();
        let src = gpu.new_texture(2, 2).unwrap();
        let dst = gpu.new_texture(2, 2).unwrap();
        let data: Vec<u8> = (0..16).map(|i| (i * 13 + 5) as u8).collect();
        gpu.replace_pixels(&src, Some(&data), region(0, 0, 2, 2));

        let mut vs = [0.0f32; 4 * VERTEX_FLOAT_COUNT];
        put_quad_vertices(
            &mut vs,
            0.0,
            0.0,
            2.0,
            2.0,
            [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            [1.0; 4],
        );
        gpu.draw_triangles(
            &dst,
            &src,
            &vs,
            &QUAD_INDICES,
            None,
            CompositeMode::Copy,
            Filter::Nearest,
            Address::ClampToZero,
        );
        assert_eq!(gpu.pixels(&dst).unwrap(), data);
    }

    #[test]
    fn clamp_to_zero_outside_bounds() {
        let gpu = SoftGpu::new();
        let src = gpu.new_texture(4, 4).unwrap();
        let dst = gpu.new_texture(4, 4).unwrap();
        gpu.replace_pixels(&src, Some(&[0xff; 64]), region(0, 0, 4, 4));

        // The quad samples a 2x2 window but is drawn 4x4, so half the
        // destination samples outside the bounds.
        let mut vs = [0.0f32; 4 * VERTEX_FLOAT_COUNT];
        put_quad_vertices(
            &mut vs,
            0.0,
            0.0,
            4.0,
            4.0,
            [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            [1.0; 4],
        );
        // Shrink the bounds to the top-left 2x2.
        for v in 0..4 {
            vs[v * VERTEX_FLOAT_COUNT + 6] = 2.0;
            vs[v * VERTEX_FLOAT_COUNT + 7] = 2.0;
        }
        gpu.draw_triangles(
            &dst,
            &src,
            &vs,
            &QUAD_INDICES,
            None,
            CompositeMode::Copy,
            Filter::Nearest,
            Address::ClampToZero,
        );
        let out = gpu.pixels(&dst).unwrap();
        assert_eq!(&out[0..4], &[0xff; 4]);
        let far = 4 * (3 * 4 + 3);
        assert_eq!(&out[far..far + 4], &[0; 4]);
    }

    #[test]
    fn source_over_keeps_destination_under_transparency() {
        let gpu = SoftGpu::new();
        let src = gpu.new_texture(1, 1).unwrap();
        let dst = gpu.new_texture(1, 1).unwrap();
        gpu.replace_pixels(&dst, Some(&[10, 20, 30, 255]), region(0, 0, 1, 1));

        let mut vs = [0.0f32; 4 * VERTEX_FLOAT_COUNT];
        put_quad_vertices(
            &mut vs,
            0.0,
            0.0,
            1.0,
            1.0,
            [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            [1.0; 4],
        );
        gpu.draw_triangles(
            &dst,
            &src,
            &vs,
            &QUAD_INDICES,
            None,
            CompositeMode::SourceOver,
            Filter::Nearest,
            Address::ClampToZero,
        );
        assert_eq!(gpu.pixels(&dst).unwrap(), vec![10, 20, 30, 255]);
    }
}
