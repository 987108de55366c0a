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

//! Logical images that migrate between private textures and shared atlases.

use crate::color::ColorM;
use crate::gpu_backend::{
    put_quad_vertices, put_vertex, Address, CompositeMode, Filter, GpuContext, QUAD_INDICES,
    VERTEX_FLOAT_COUNT,
};
use crate::packing::{Node, Page};
use crate::restorable::{self, Graphics};
use crate::{region, Region};

use ahash::RandomState;
use hashbrown::HashMap;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// The number of consecutive frames an image must be used only as a source
/// before it is promoted to a shared atlas.
pub const MAX_COUNT_FOR_SHARE: i32 = 10;

/// A texture hosting either a single private image or, when a page is
/// present, many shared images packed by the page.
struct Backend<C: GpuContext + ?Sized> {
    restorable: restorable::Image<C>,

    // If absent, the backend is private to one image.
    page: Option<Page>,
}

impl<C: GpuContext + ?Sized> Backend<C> {
    /// Allocate a rectangle, extending the page (and the backing texture in
    /// lockstep) as many times as a planning pass on a clone says is needed.
    fn try_alloc(&mut self, width: i32, height: i32) -> Option<Node> {
        let page = self.page.as_mut().unwrap();
        if let Some(n) = page.alloc(width, height) {
            return Some(n);
        }

        // Simulate extensions on a clone to find the minimum count that
        // satisfies the request.
        let mut plan = page.clone();
        let mut extensions = 0;
        loop {
            if !plan.extend() {
                return None;
            }
            extensions += 1;
            if plan.alloc(width, height).is_some() {
                break;
            }
        }

        for _ in 0..extensions {
            page.extend();
        }
        let size = page.size();
        tracing::debug!(size, "extending a shared backend");
        self.restorable = self.restorable.extend(size, size);

        let n = page
            .alloc(width, height)
            .expect("shareable: allocation must not fail after extension");
        Some(n)
    }
}

struct ImageState<C: GpuContext + ?Sized> {
    width: i32,
    height: i32,
    disposed: bool,

    backend: Option<Rc<RefCell<Backend<C>>>>,

    // Set iff the image occupies a node inside its backend's page.
    node: Option<Node>,

    /// Frames since the image was last the target of a draw. Reset to 0 on
    /// every target use; pixel replacement does not affect it.
    non_updated_count: i32,

    never_shared: bool,
}

impl<C: GpuContext + ?Sized> ImageState<C> {
    fn unallocated(width: i32, height: i32) -> Self {
        ImageState {
            width,
            height,
            disposed: false,
            backend: None,
            node: None,
            non_updated_count: 0,
            never_shared: false,
        }
    }
}

struct AtlasState<C: GpuContext + ?Sized> {
    backends: Vec<Rc<RefCell<Backend<C>>>>,
    to_share: HashMap<usize, Weak<RefCell<ImageState<C>>>, RandomState>,
    min_size: i32,
    max_size: i32,
}

/// The process-wide shareable state: the shared backends, the promotion
/// candidate set and the atlas size limits.
///
/// Every entry point borrows the inner state for its full body, so a
/// re-entrant use fails loudly instead of corrupting the backends.
pub(crate) struct Atlases<C: GpuContext + ?Sized> {
    gfx: Rc<Graphics<C>>,
    state: RefCell<AtlasState<C>>,
}

fn key<C: GpuContext + ?Sized>(cell: &Rc<RefCell<ImageState<C>>>) -> usize {
    Rc::as_ptr(cell) as usize
}

fn shareable_state<C: GpuContext + ?Sized>(st: &AtlasState<C>, s: &ImageState<C>) -> bool {
    !s.never_shared && s.width <= st.max_size && s.height <= st.max_size
}

fn region_of<C: GpuContext + ?Sized>(s: &ImageState<C>) -> Region {
    let backend = s
        .backend
        .as_ref()
        .expect("shareable: the image must be allocated");
    match s.node {
        None => {
            let (w, h) = backend.borrow().restorable.size();
            region(0, 0, w, h)
        }
        Some(node) => backend.borrow().page.as_ref().unwrap().region(node),
    }
}

fn at_state<C: GpuContext + ?Sized>(s: &ImageState<C>, x: i32, y: i32) -> (u8, u8, u8, u8) {
    let Some(backend) = &s.backend else {
        return (0, 0, 0, 0);
    };
    let r = region_of(s);
    if x < 0 || y < 0 || x >= r.width() || y >= r.height() {
        return (0, 0, 0, 0);
    }
    backend.borrow().restorable.at(x + r.min.x, y + r.min.y)
}

fn replace_pixels_state<C: GpuContext + ?Sized>(s: &ImageState<C>, pixels: Option<&[u8]>) {
    let r = region_of(s);
    if let Some(p) = pixels {
        let want = 4 * (r.width() * r.height()) as usize;
        assert!(
            p.len() == want,
            "shareable: len(p) must be {} but {}",
            want,
            p.len()
        );
    }
    s.backend
        .as_ref()
        .unwrap()
        .borrow()
        .restorable
        .replace_pixels(pixels, r);
}

impl<C: GpuContext + ?Sized> Atlases<C> {
    pub(crate) fn new(gfx: Rc<Graphics<C>>) -> Rc<Self> {
        let (min_size, max_size) = if gfx.driver.has_high_precision_float() {
            // Stay at 4096 whatever the driver accepts; bigger atlas
            // textures are not known to work reliably everywhere.
            (1024, 4096.min(gfx.driver.max_texture_size()))
        } else {
            (512, 512)
        };
        tracing::debug!(min_size, max_size, "atlas size limits");
        Rc::new(Atlases {
            gfx,
            state: RefCell::new(AtlasState {
                backends: Vec::new(),
                to_share: HashMap::with_hasher(RandomState::new()),
                min_size,
                max_size,
            }),
        })
    }

    /// The promotion pass: count a frame for every candidate and promote the
    /// ones that stayed source-only for [`MAX_COUNT_FOR_SHARE`] frames.
    /// Candidates re-enter the set on their next source use.
    pub(crate) fn make_images_shared(&self) {
        let mut st = self.state.borrow_mut();
        let candidates: Vec<_> = st.to_share.drain().map(|(_, w)| w).collect();
        for weak in candidates {
            let Some(cell) = weak.upgrade() else {
                continue;
            };
            if cell.borrow().disposed {
                continue;
            }
            cell.borrow_mut().non_updated_count += 1;
            if cell.borrow().non_updated_count >= MAX_COUNT_FOR_SHARE {
                self.make_shared(&mut st, &cell);
            }
        }
    }

    fn allocate(
        &self,
        st: &mut AtlasState<C>,
        cell: &Rc<RefCell<ImageState<C>>>,
        want_shared: bool,
    ) {
        let mut s = cell.borrow_mut();
        self.allocate_into(st, &mut s, want_shared);
    }

    fn allocate_into(&self, st: &mut AtlasState<C>, s: &mut ImageState<C>, want_shared: bool) {
        assert!(s.backend.is_none(), "shareable: the image is already allocated");

        if !want_shared || !shareable_state(st, s) {
            s.backend = Some(Rc::new(RefCell::new(Backend {
                restorable: restorable::Image::new(&self.gfx, s.width, s.height),
                page: None,
            })));
            return;
        }

        for backend in &st.backends {
            if let Some(node) = backend.borrow_mut().try_alloc(s.width, s.height) {
                s.backend = Some(backend.clone());
                s.node = Some(node);
                return;
            }
        }

        let mut size = st.min_size;
        while s.width > size || s.height > size {
            assert!(
                size != st.max_size,
                "shareable: the image being shared is too big: width: {}, height: {}",
                s.width,
                s.height
            );
            size *= 2;
        }
        tracing::debug!(size, "creating a new shared backend");
        let backend = Rc::new(RefCell::new(Backend {
            restorable: restorable::Image::new(&self.gfx, size, size),
            page: Some(Page::new(size, st.max_size)),
        }));
        st.backends.push(backend.clone());
        let node = backend
            .borrow_mut()
            .page
            .as_mut()
            .unwrap()
            .alloc(s.width, s.height)
            .expect("shareable: allocation must not fail for a fresh backend");
        s.backend = Some(backend);
        s.node = Some(node);
    }

    /// Promote a private image into a shared atlas. The image's inner record
    /// is swapped in place, so every outside handle observes the move.
    fn make_shared(&self, st: &mut AtlasState<C>, cell: &Rc<RefCell<ImageState<C>>>) {
        if cell.borrow().backend.is_none() {
            self.allocate(st, cell, true);
            return;
        }
        if cell.borrow().node.is_some() {
            return;
        }
        assert!(
            shareable_state(st, &cell.borrow()),
            "shareable: make_shared cannot be called on a non-shareable image"
        );
        let (width, height) = {
            let s = cell.borrow();
            (s.width, s.height)
        };
        tracing::debug!(width, height, "promoting an image to a shared atlas");

        let mut new_state = ImageState::unallocated(width, height);
        self.allocate_into(st, &mut new_state, true);

        let mut pixels = vec![0u8; 4 * (width * height) as usize];
        {
            let s = cell.borrow();
            for y in 0..height {
                for x in 0..width {
                    let (r, g, b, a) = at_state(&s, x, y);
                    let idx = 4 * (y * width + x) as usize;
                    pixels[idx] = r;
                    pixels[idx + 1] = g;
                    pixels[idx + 2] = b;
                    pixels[idx + 3] = a;
                }
            }
        }
        replace_pixels_state(&new_state, Some(&pixels));

        let old = std::mem::replace(&mut *cell.borrow_mut(), new_state);
        self.dispose_backing(st, old.backend, old.node);
        cell.borrow_mut().non_updated_count = 0;
    }

    /// Demote a shared image to a private texture before it is mutated: a
    /// fresh restorable is created and the atlas node is copied into it.
    fn ensure_not_shared(&self, st: &mut AtlasState<C>, cell: &Rc<RefCell<ImageState<C>>>) {
        if cell.borrow().backend.is_none() {
            // Not allocated yet: a target allocation is never shared.
            self.allocate(st, cell, false);
            return;
        }
        if cell.borrow().node.is_none() {
            return;
        }

        let (width, height, r, backend) = {
            let s = cell.borrow();
            let r = region_of(&s);
            (s.width, s.height, r, s.backend.clone().unwrap())
        };
        tracing::debug!(width, height, "demoting a shared image to a private texture");

        let new_img = restorable::Image::new(&self.gfx, width, height);
        let mut vs = vec![0.0f32; 4 * VERTEX_FLOAT_COUNT];
        put_quad_vertices(
            &mut vs,
            r.min.x as f32,
            r.min.y as f32,
            r.max.x as f32,
            r.max.y as f32,
            [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            [1.0; 4],
        );
        new_img.draw_triangles(
            &backend.borrow().restorable,
            vs,
            QUAD_INDICES.to_vec(),
            None,
            CompositeMode::Copy,
            Filter::Nearest,
            Address::ClampToZero,
        );

        let (old_backend, old_node) = {
            let mut s = cell.borrow_mut();
            (s.backend.take(), s.node.take())
        };
        self.dispose_backing(st, old_backend, old_node);
        cell.borrow_mut().backend = Some(Rc::new(RefCell::new(Backend {
            restorable: new_img,
            page: None,
        })));
    }

    /// Release an image's backing: a private backend is destroyed; a node is
    /// freed, destroying the backend once its page is empty.
    fn dispose_backing(
        &self,
        st: &mut AtlasState<C>,
        backend: Option<Rc<RefCell<Backend<C>>>>,
        node: Option<Node>,
    ) {
        let Some(backend) = backend else {
            // Not allocated yet.
            return;
        };
        match node {
            None => backend.borrow().restorable.dispose(),
            Some(node) => {
                let mut b = backend.borrow_mut();
                let page = b.page.as_mut().unwrap();
                let r = page.region(node);
                page.free(node);
                if !b.page.as_ref().unwrap().is_empty() {
                    // The node area can be handed out again; clear it so the
                    // next occupant starts transparent.
                    b.restorable.clear_pixels(r);
                } else {
                    tracing::debug!("destroying an empty shared backend");
                    b.restorable.dispose();
                    drop(b);
                    st.backends.retain(|x| !Rc::ptr_eq(x, &backend));
                }
            }
        }
    }
}

/// A logical image backed privately or by a node in a shared atlas.
pub(crate) struct Image<C: GpuContext + ?Sized> {
    atlases: Rc<Atlases<C>>,
    state: Rc<RefCell<ImageState<C>>>,
}

impl<C: GpuContext + ?Sized> Drop for Image<C> {
    fn drop(&mut self) {
        // Leaked handles release their backing here; Dispose is the contract.
        if !self.state.borrow().disposed {
            self.dispose();
        }
    }
}

impl<C: GpuContext + ?Sized> Image<C> {
    pub(crate) fn new(atlases: &Rc<Atlases<C>>, width: i32, height: i32) -> Self {
        // Actual allocation is done lazily, at the first write.
        Image {
            atlases: atlases.clone(),
            state: Rc::new(RefCell::new(ImageState::unallocated(width, height))),
        }
    }

    pub(crate) fn new_screen_framebuffer(
        atlases: &Rc<Atlases<C>>,
        width: i32,
        height: i32,
    ) -> Self {
        let restorable = restorable::Image::new_screen_framebuffer(&atlases.gfx, width, height);
        let mut state = ImageState::unallocated(width, height);
        state.backend = Some(Rc::new(RefCell::new(Backend {
            restorable,
            page: None,
        })));
        state.never_shared = true;
        Image {
            atlases: atlases.clone(),
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub(crate) fn atlases(&self) -> &Rc<Atlases<C>> {
        &self.atlases
    }

    pub(crate) fn size(&self) -> (i32, i32) {
        let s = self.state.borrow();
        (s.width, s.height)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.borrow().disposed
    }

    pub(crate) fn is_shared_for_testing(&self) -> bool {
        let _st = self.atlases.state.borrow();
        self.state.borrow().node.is_some()
    }

    pub(crate) fn is_volatile(&self) -> bool {
        let _st = self.atlases.state.borrow();
        match &self.state.borrow().backend {
            // Not allocated yet; only non-volatile images allocate lazily.
            None => false,
            Some(b) => b.borrow().restorable.is_volatile(),
        }
    }

    /// Build the driver vertices of a quad over the source region
    /// `(sx0, sy0)-(sx1, sy1)` in this image's coordinates, translating by
    /// the atlas offset when the image is shared.
    pub(crate) fn quad_vertices(
        &self,
        sx0: i32,
        sy0: i32,
        sx1: i32,
        sy1: i32,
        geo: [f32; 6],
        color: [f32; 4],
    ) -> Vec<f32> {
        let mut st = self.atlases.state.borrow_mut();
        if self.state.borrow().backend.is_none() {
            self.atlases.allocate(&mut st, &self.state, true);
        }
        let r = region_of(&self.state.borrow());
        let (ox, oy) = (r.min.x as f32, r.min.y as f32);
        let mut vs = vec![0.0f32; 4 * VERTEX_FLOAT_COUNT];
        put_quad_vertices(
            &mut vs,
            sx0 as f32 + ox,
            sy0 as f32 + oy,
            sx1 as f32 + ox,
            sy1 as f32 + oy,
            geo,
            color,
        );
        vs
    }

    /// Build driver vertices from user vertices whose source coordinates and
    /// bounds live in this image's coordinate space.
    pub(crate) fn triangle_vertices(
        &self,
        vertices: &[crate::image::Vertex],
        bounds: Region,
    ) -> Vec<f32> {
        let mut st = self.atlases.state.borrow_mut();
        if self.state.borrow().backend.is_none() {
            self.atlases.allocate(&mut st, &self.state, true);
        }
        let r = region_of(&self.state.borrow());
        let (ox, oy) = (r.min.x as f32, r.min.y as f32);
        let b = [
            bounds.min.x as f32 + ox,
            bounds.min.y as f32 + oy,
            bounds.max.x as f32 + ox,
            bounds.max.y as f32 + oy,
        ];
        let mut vs = vec![0.0f32; vertices.len() * VERTEX_FLOAT_COUNT];
        for (i, v) in vertices.iter().enumerate() {
            put_vertex(
                &mut vs[i * VERTEX_FLOAT_COUNT..],
                v.dst_x,
                v.dst_y,
                v.src_x + ox,
                v.src_y + oy,
                b,
                v.color_r,
                v.color_g,
                v.color_b,
                v.color_a,
            );
        }
        vs
    }

    /// Draw a triangle list from `src` onto this image. The target is
    /// demoted to a private texture first; the source becomes a promotion
    /// candidate when it stays shareable.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn draw_triangles(
        &self,
        src: &Image<C>,
        vertices: Vec<f32>,
        indices: Vec<u16>,
        color_matrix: Option<ColorM>,
        mode: CompositeMode,
        filter: Filter,
        address: Address,
    ) {
        let mut st = self.atlases.state.borrow_mut();
        assert!(
            !src.state.borrow().disposed,
            "shareable: the drawing source image must not be disposed"
        );
        assert!(
            !self.state.borrow().disposed,
            "shareable: the drawing target image must not be disposed"
        );
        if src.state.borrow().backend.is_none() {
            self.atlases.allocate(&mut st, &src.state, true);
        }

        self.atlases.ensure_not_shared(&mut st, &self.state);

        {
            // Compare after un-sharing the target, or distinct images could
            // still point at the same atlas texture.
            let target_backend = self.state.borrow().backend.clone().unwrap();
            let source_backend = src.state.borrow().backend.clone().unwrap();
            let tb = target_backend.borrow();
            let sb = source_backend.borrow();
            assert!(
                !tb.restorable.ptr_eq(&sb.restorable),
                "shareable: the drawing source must be different from the target"
            );
            tb.restorable.draw_triangles(
                &sb.restorable,
                vertices,
                indices,
                color_matrix,
                mode,
                filter,
                address,
            );
        }

        self.state.borrow_mut().non_updated_count = 0;
        st.to_share.remove(&key(&self.state));

        let src_candidate = {
            let s = src.state.borrow();
            s.node.is_none() && shareable_state(&st, &s)
        };
        if src_candidate {
            st.to_share.insert(key(&src.state), Rc::downgrade(&src.state));
        }
    }

    pub(crate) fn reset_restoring_state(&self) {
        let _st = self.atlases.state.borrow();
        if let Some(backend) = &self.state.borrow().backend {
            backend.borrow().restorable.reset_restoring_state();
        }
    }

    pub(crate) fn replace_pixels(&self, pixels: Option<&[u8]>) {
        let mut st = self.atlases.state.borrow_mut();
        assert!(
            !self.state.borrow().disposed,
            "shareable: the image must not be disposed at replace_pixels"
        );
        if self.state.borrow().backend.is_none() {
            if pixels.is_none() {
                return;
            }
            self.atlases.allocate(&mut st, &self.state, true);
        }
        replace_pixels_state(&self.state.borrow(), pixels);
    }

    pub(crate) fn at(&self, x: i32, y: i32) -> (u8, u8, u8, u8) {
        let _st = self.atlases.state.borrow();
        at_state(&self.state.borrow(), x, y)
    }

    pub(crate) fn dispose(&self) {
        let mut st = self.atlases.state.borrow_mut();
        let (backend, node) = {
            let mut s = self.state.borrow_mut();
            if s.disposed {
                return;
            }
            s.disposed = true;
            (s.backend.take(), s.node.take())
        };
        self.atlases.dispose_backing(&mut st, backend, node);
    }

    /// Make the image volatile: demoted to private, cleared every frame,
    /// and never shared again.
    pub(crate) fn make_volatile(&self) {
        let mut st = self.atlases.state.borrow_mut();
        self.atlases.ensure_not_shared(&mut st, &self.state);
        self.state
            .borrow()
            .backend
            .as_ref()
            .unwrap()
            .borrow()
            .restorable
            .make_volatile();
        self.state.borrow_mut().never_shared = true;
        st.to_share.remove(&key(&self.state));
    }
}
