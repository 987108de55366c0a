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

//! Logical textures that record their drawing history and can replay it
//! after a device loss.

use crate::color::ColorM;
use crate::gpu_backend::{
    put_quad_vertices, Address, CompositeMode, Filter, GpuContext, Texture, QUAD_INDICES,
    VERTEX_FLOAT_COUNT,
};
use crate::{region, Error, Region};

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// The maximum number of history entries kept per image. Beyond this the
/// image is made stale and resolved by a readback instead.
pub(crate) const MAX_DRAW_HISTORY: usize = 1024;

/// Driver plus the process-wide restoration state, shared by every image.
pub(crate) struct Graphics<C: GpuContext + ?Sized> {
    pub(crate) driver: Rc<C>,
    pub(crate) images: Images<C>,
    error: RefCell<Option<Error>>,
    force_restoring: Cell<bool>,
}

impl<C: GpuContext + ?Sized> Graphics<C> {
    pub(crate) fn new(driver: Rc<C>) -> Rc<Self> {
        Rc::new(Graphics {
            driver,
            images: Images {
                entries: RefCell::new(Vec::new()),
            },
            error: RefCell::new(None),
            force_restoring: Cell::new(false),
        })
    }

    pub(crate) fn needs_restoring(&self) -> bool {
        self.force_restoring.get() || self.driver.needs_restoring()
    }

    pub(crate) fn enable_restoring_for_testing(&self) {
        self.force_restoring.set(true);
    }

    /// Latch the first driver error for later inspection.
    pub(crate) fn latch_driver_error(&self, err: C::Error) {
        let mut slot = self.error.borrow_mut();
        if slot.is_none() {
            tracing::warn!("graphics driver error: {err}");
            *slot = Some(Error::Driver(Box::new(err)));
        }
    }

    pub(crate) fn take_error(&self) -> Option<Error> {
        self.error.borrow_mut().take()
    }

    /// Flush queued commands and resolve all stale images by reading their
    /// pixels back. Intended to be called at the end of a frame.
    pub(crate) fn resolve_stale_images(&self) {
        self.driver.flush();
        if !self.needs_restoring() {
            return;
        }
        for state in self.images.live() {
            state.borrow_mut().resolve_stale();
        }
    }

    /// Restore all images after a device loss, priority images first and
    /// sources before their dependents.
    pub(crate) fn restore_if_needed(&self) -> Result<(), Error> {
        if !self.needs_restoring() {
            return Ok(());
        }
        if !self.force_restoring.get() {
            // is_invalidated is expensive; probe a single non-screen image
            // and assume invalidation hits every image at once.
            let mut invalidated = false;
            for state in self.images.live() {
                let s = state.borrow();
                if s.screen {
                    continue;
                }
                if let Some(t) = &s.texture {
                    invalidated = self.driver.is_invalidated(t.resource());
                }
                break;
            }
            if !invalidated {
                return Ok(());
            }
        }
        self.driver
            .reset_state()
            .map_err(|e| Error::Driver(Box::new(e)))?;
        self.images.restore()
    }
}

/// The set of all live restorable images.
pub(crate) struct Images<C: GpuContext + ?Sized> {
    entries: RefCell<Vec<Weak<RefCell<State<C>>>>>,
}

impl<C: GpuContext + ?Sized> Images<C> {
    fn register(&self, state: &Rc<RefCell<State<C>>>) {
        let mut entries = self.entries.borrow_mut();
        entries.retain(|w| w.strong_count() > 0);
        entries.push(Rc::downgrade(state));
    }

    fn remove(&self, target: &Weak<RefCell<State<C>>>) {
        self.make_stale_if_depending_on(target);
        self.entries
            .borrow_mut()
            .retain(|w| w.strong_count() > 0 && !Weak::ptr_eq(w, target));
    }

    fn live(&self) -> Vec<Rc<RefCell<State<C>>>> {
        self.entries
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Make every image whose history references `target` stale: once the
    /// target changes in a way its dependents' histories cannot see, those
    /// histories can no longer restore them.
    fn make_stale_if_depending_on(&self, target: &Weak<RefCell<State<C>>>) {
        for state in self.live() {
            let mut s = state.borrow_mut();
            if s.stale {
                continue;
            }
            if s.depends_on(target) {
                s.make_stale();
            }
        }
    }

    /// Clear every volatile image. Intended to be called at the start of a
    /// frame; volatile contents do not survive frame boundaries.
    pub(crate) fn clear_volatile_images(&self) {
        for state in self.live() {
            let volatile = state.borrow().volatile;
            if volatile {
                clear_state(&state);
            }
        }
    }

    fn restore(&self) -> Result<(), Error> {
        let live = self.live();
        tracing::debug!("restoring {} images", live.len());

        // Topological order over the history dependencies. The graph is
        // acyclic: a draw that would close a cycle makes the participants
        // stale, truncating their history before the cycle is recorded.
        let mut sorted: Vec<_> = live
            .iter()
            .filter(|s| s.borrow().priority)
            .cloned()
            .collect();
        let mut remaining: Vec<_> = live
            .iter()
            .filter(|s| !s.borrow().priority)
            .cloned()
            .collect();
        while !remaining.is_empty() {
            let ready: Vec<usize> = (0..remaining.len())
                .filter(|&i| {
                    let s = remaining[i].borrow();
                    s.dependencies().iter().all(|dep| {
                        !remaining
                            .iter()
                            .any(|r| dep.upgrade().is_some_and(|d| Rc::ptr_eq(&d, r)))
                    })
                })
                .collect();
            if ready.is_empty() {
                panic!("restorable: cyclic image dependency detected at restore");
            }
            for &i in ready.iter().rev() {
                sorted.push(remaining.swap_remove(i));
            }
        }

        for state in &sorted {
            restore_state(state)?;
        }
        Ok(())
    }
}

enum HistoryEntry<C: GpuContext + ?Sized> {
    /// A pixel-region write. `None` pixels mean the region was cleared.
    Pixels {
        pixels: Option<Vec<u8>>,
        region: Region,
    },
    /// A triangle draw from another image.
    Draw {
        source: Weak<RefCell<State<C>>>,
        vertices: Vec<f32>,
        indices: Vec<u16>,
        color_matrix: Option<ColorM>,
        mode: CompositeMode,
        filter: Filter,
        address: Address,
    },
}

impl<C: GpuContext + ?Sized> Clone for HistoryEntry<C> {
    fn clone(&self) -> Self {
        match self {
            HistoryEntry::Pixels { pixels, region } => HistoryEntry::Pixels {
                pixels: pixels.clone(),
                region: *region,
            },
            HistoryEntry::Draw {
                source,
                vertices,
                indices,
                color_matrix,
                mode,
                filter,
                address,
            } => HistoryEntry::Draw {
                source: source.clone(),
                vertices: vertices.clone(),
                indices: indices.clone(),
                color_matrix: color_matrix.clone(),
                mode: *mode,
                filter: *filter,
                address: *address,
            },
        }
    }
}

pub(crate) struct State<C: GpuContext + ?Sized> {
    gfx: Rc<Graphics<C>>,
    self_weak: Weak<RefCell<State<C>>>,
    texture: Option<Texture<C>>,
    width: i32,
    height: i32,
    /// CPU snapshot anchoring the history, when known.
    base_pixels: Option<Vec<u8>>,
    history: Vec<HistoryEntry<C>>,
    /// The history no longer suffices; pixels must be read back before the
    /// history can be trusted again.
    stale: bool,
    volatile: bool,
    screen: bool,
    priority: bool,
    disposed: bool,
}

impl<C: GpuContext + ?Sized> State<C> {
    fn make_stale(&mut self) {
        self.base_pixels = None;
        self.history.clear();
        self.stale = true;
        // Stale-ness is not propagated to dependents here: an image drawing
        // from a stale source is made stale at draw time, and the source is
        // resolved by a readback before any restore runs.
    }

    fn depends_on(&self, target: &Weak<RefCell<State<C>>>) -> bool {
        self.history.iter().any(|e| match e {
            HistoryEntry::Draw { source, .. } => Weak::ptr_eq(source, target),
            HistoryEntry::Pixels { .. } => false,
        })
    }

    fn dependencies(&self) -> Vec<Weak<RefCell<State<C>>>> {
        self.history
            .iter()
            .filter_map(|e| match e {
                HistoryEntry::Draw { source, .. } => Some(source.clone()),
                HistoryEntry::Pixels { .. } => None,
            })
            .collect()
    }

    fn read_pixels_from_gpu(&mut self) {
        self.gfx.driver.flush();
        self.base_pixels = match &self.texture {
            Some(t) => match self.gfx.driver.pixels(t.resource()) {
                Ok(p) => Some(p),
                Err(e) => {
                    self.gfx.latch_driver_error(e);
                    None
                }
            },
            None => None,
        };
        self.history.clear();
        self.stale = false;
    }

    fn resolve_stale(&mut self) {
        if self.volatile || self.screen || !self.stale {
            return;
        }
        self.read_pixels_from_gpu();
    }

    fn append_draw_history(
        &mut self,
        source: Weak<RefCell<State<C>>>,
        vertices: Vec<f32>,
        indices: Vec<u16>,
        color_matrix: Option<ColorM>,
        mode: CompositeMode,
        filter: Filter,
        address: Address,
    ) {
        if self.stale {
            return;
        }
        if self.volatile || self.screen {
            // Transient targets keep no history; drop any cached pixels so
            // reads go back to the driver.
            self.base_pixels = None;
            self.history.clear();
            return;
        }
        if self.history.len() + 1 > MAX_DRAW_HISTORY {
            self.make_stale();
            return;
        }
        self.history.push(HistoryEntry::Draw {
            source,
            vertices,
            indices,
            color_matrix,
            mode,
            filter,
            address,
        });
    }
}

/// A logical texture that can rebuild itself after a device loss.
pub(crate) struct Image<C: GpuContext + ?Sized> {
    state: Rc<RefCell<State<C>>>,
}

impl<C: GpuContext + ?Sized> Image<C> {
    pub(crate) fn new(gfx: &Rc<Graphics<C>>, width: i32, height: i32) -> Self {
        Self::with_flags(gfx, width, height, false, false)
    }

    /// The image backing the screen framebuffer. It is placed first during
    /// restoration so dependents can re-reference it, but its contents are
    /// transient and never re-uploaded.
    pub(crate) fn new_screen_framebuffer(gfx: &Rc<Graphics<C>>, width: i32, height: i32) -> Self {
        Self::with_flags(gfx, width, height, true, true)
    }

    fn with_flags(
        gfx: &Rc<Graphics<C>>,
        width: i32,
        height: i32,
        screen: bool,
        priority: bool,
    ) -> Self {
        assert!(
            width > 0 && height > 0,
            "restorable: width and height must be positive"
        );
        let texture = {
            let res = if screen {
                Texture::new_screen_framebuffer(&gfx.driver, width, height)
            } else {
                Texture::new(&gfx.driver, width, height)
            };
            match res {
                Ok(t) => Some(t),
                Err(e) => {
                    gfx.latch_driver_error(e);
                    None
                }
            }
        };
        let state = Rc::new_cyclic(|weak| {
            RefCell::new(State {
                gfx: gfx.clone(),
                self_weak: weak.clone(),
                texture,
                width,
                height,
                base_pixels: None,
                history: Vec::new(),
                stale: false,
                volatile: false,
                screen,
                priority,
                disposed: false,
            })
        });
        gfx.images.register(&state);
        Image { state }
    }

    pub(crate) fn size(&self) -> (i32, i32) {
        let s = self.state.borrow();
        (s.width, s.height)
    }

    pub(crate) fn is_volatile(&self) -> bool {
        self.state.borrow().volatile
    }

    #[cfg(test)]
    pub(crate) fn is_disposed(&self) -> bool {
        self.state.borrow().disposed
    }

    #[cfg(test)]
    pub(crate) fn is_stale(&self) -> bool {
        self.state.borrow().stale
    }

    pub(crate) fn ptr_eq(&self, other: &Image<C>) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    /// Make the image volatile: no history is kept and its contents are
    /// cleared at every frame boundary instead of being restored.
    pub(crate) fn make_volatile(&self) {
        let (gfx, self_weak) = {
            let s = self.state.borrow();
            (s.gfx.clone(), s.self_weak.clone())
        };
        // Dependents recorded draws of the non-volatile content; they can no
        // longer restore from this image.
        gfx.images.make_stale_if_depending_on(&self_weak);
        let mut s = self.state.borrow_mut();
        s.volatile = true;
        s.base_pixels = None;
        s.history.clear();
        s.stale = false;
    }

    /// Drop the restoring state after a full overwrite made it redundant.
    pub(crate) fn reset_restoring_state(&self) {
        let mut s = self.state.borrow_mut();
        s.base_pixels = None;
        s.history.clear();
        s.stale = false;
    }

    /// Replace the pixels of a region.
    ///
    /// A write covering the whole image becomes the new base snapshot and
    /// truncates the history; a partial write is recorded as a pixel-region
    /// history entry. `None` pixels clear the region.
    pub(crate) fn replace_pixels(&self, pixels: Option<&[u8]>, r: Region) {
        let (gfx, self_weak) = {
            let s = self.state.borrow();
            (s.gfx.clone(), s.self_weak.clone())
        };
        // The content changes under any image that drew from it; those
        // histories can no longer restore their owners.
        gfx.images.make_stale_if_depending_on(&self_weak);

        let mut s = self.state.borrow_mut();
        assert!(!s.disposed, "restorable: the image must not be disposed");
        assert!(
            !s.screen,
            "restorable: a screen image cannot be written with pixels"
        );
        assert!(
            r.width() > 0 && r.height() > 0,
            "restorable: the region must not be empty"
        );
        assert!(
            r.min.x >= 0 && r.min.y >= 0 && r.max.x <= s.width && r.max.y <= s.height,
            "restorable: the region must be within the image"
        );
        if let Some(p) = pixels {
            let want = 4 * (r.width() * r.height()) as usize;
            assert!(
                p.len() == want,
                "restorable: len(pixels) must be {} but {}",
                want,
                p.len()
            );
        }
        if let Some(t) = &s.texture {
            s.gfx.driver.replace_pixels(t.resource(), pixels, r);
        }

        if r == region(0, 0, s.width, s.height) {
            s.base_pixels = pixels.map(|p| p.to_vec());
            s.history.clear();
            s.stale = false;
            return;
        }
        if s.volatile || s.screen || s.stale {
            return;
        }
        if s.history.len() + 1 > MAX_DRAW_HISTORY {
            s.make_stale();
            return;
        }
        let entry = HistoryEntry::Pixels {
            pixels: pixels.map(|p| p.to_vec()),
            region: r,
        };
        s.history.push(entry);
    }

    /// Signal that a region is zero without materializing a buffer.
    pub(crate) fn clear_pixels(&self, r: Region) {
        self.replace_pixels(None, r);
    }

    /// Draw a triangle list from `src` onto this image, recording the
    /// operation so it can be replayed after a device loss.
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
        {
            let s = self.state.borrow();
            assert!(!s.disposed, "restorable: the draw target must not be disposed");
        }
        assert!(
            !self.ptr_eq(src),
            "restorable: the draw source must be different from the target"
        );
        if vertices.is_empty() {
            return;
        }
        let (gfx, self_weak) = {
            let s = self.state.borrow();
            (s.gfx.clone(), s.self_weak.clone())
        };
        // The target is about to change; dependents can no longer restore
        // from their recorded draws of it.
        gfx.images.make_stale_if_depending_on(&self_weak);

        let (src_weak, src_unrestorable) = {
            let ss = src.state.borrow();
            assert!(!ss.disposed, "restorable: the draw source must not be disposed");
            (ss.self_weak.clone(), ss.stale || ss.volatile || ss.screen)
        };

        {
            let s = self.state.borrow();
            let ss = src.state.borrow();
            if let (Some(t), Some(st)) = (&s.texture, &ss.texture) {
                gfx.driver.draw_triangles(
                    t.resource(),
                    st.resource(),
                    &vertices,
                    &indices,
                    color_matrix.as_ref(),
                    mode,
                    filter,
                    address,
                );
            }
        }

        let mut s = self.state.borrow_mut();
        // A draw from a stale, volatile or screen source cannot be replayed.
        // Neither can any draw on a driver that never restores; such targets
        // stay stale and reads fall back to a readback.
        if src_unrestorable || !gfx.needs_restoring() {
            s.make_stale();
        } else {
            s.append_draw_history(
                src_weak,
                vertices,
                indices,
                color_matrix,
                mode,
                filter,
                address,
            );
        }
    }

    /// Read one pixel, flushing pending commands and reading back from the
    /// driver when the CPU-side state is not sufficient.
    pub(crate) fn at(&self, x: i32, y: i32) -> (u8, u8, u8, u8) {
        let mut s = self.state.borrow_mut();
        if s.disposed || s.texture.is_none() {
            return (0, 0, 0, 0);
        }
        if x < 0 || y < 0 || x >= s.width || y >= s.height {
            return (0, 0, 0, 0);
        }
        if s.base_pixels.is_none() || !s.history.is_empty() || s.stale {
            s.read_pixels_from_gpu();
        }
        match &s.base_pixels {
            Some(p) => {
                let idx = 4 * (y * s.width + x) as usize;
                (p[idx], p[idx + 1], p[idx + 2], p[idx + 3])
            }
            None => (0, 0, 0, 0),
        }
    }

    /// Grow the backing texture, returning a new image with the same
    /// contents and history. This image is disposed.
    pub(crate) fn extend(&self, width: i32, height: i32) -> Image<C> {
        let gfx = {
            let s = self.state.borrow();
            assert!(!s.disposed, "restorable: a disposed image cannot be extended");
            assert!(!s.screen, "restorable: a screen image cannot be extended");
            assert!(
                width >= s.width && height >= s.height,
                "restorable: an image can only be extended, not shrunk"
            );
            s.gfx.clone()
        };
        let new_img = Image::new(&gfx, width, height);
        {
            let s = self.state.borrow();
            let mut ns = new_img.state.borrow_mut();
            ns.volatile = s.volatile;
            ns.stale = s.stale;
            ns.history = s.history.clone();
            ns.base_pixels = s.base_pixels.as_ref().map(|p| {
                let mut grown = vec![0u8; 4 * (width * height) as usize];
                for row in 0..s.height {
                    let src = 4 * (row * s.width) as usize;
                    let dst = 4 * (row * width) as usize;
                    let len = 4 * s.width as usize;
                    grown[dst..dst + len].copy_from_slice(&p[src..src + len]);
                }
                grown
            });
            // Copy on the driver as well; this copy is not part of the
            // recorded history.
            if let (Some(nt), Some(ot)) = (&ns.texture, &s.texture) {
                let mut vs = [0.0f32; 4 * VERTEX_FLOAT_COUNT];
                put_quad_vertices(
                    &mut vs,
                    0.0,
                    0.0,
                    s.width as f32,
                    s.height as f32,
                    [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
                    [1.0; 4],
                );
                gfx.driver.draw_triangles(
                    nt.resource(),
                    ot.resource(),
                    &vs,
                    &QUAD_INDICES,
                    None,
                    CompositeMode::Copy,
                    Filter::Nearest,
                    Address::ClampToZero,
                );
            }
        }
        self.dispose();
        new_img
    }

    /// Dispose the image. All images whose history references it are made
    /// stale so they resolve by readback instead of replaying a dead source.
    pub(crate) fn dispose(&self) {
        let (gfx, self_weak) = {
            let s = self.state.borrow();
            if s.disposed {
                return;
            }
            (s.gfx.clone(), s.self_weak.clone())
        };
        gfx.images.remove(&self_weak);
        let mut s = self.state.borrow_mut();
        s.texture = None;
        s.base_pixels = None;
        s.history.clear();
        s.stale = false;
        s.disposed = true;
    }
}

fn clear_state<C: GpuContext + ?Sized>(state: &Rc<RefCell<State<C>>>) {
    let (gfx, self_weak) = {
        let s = state.borrow();
        if s.disposed {
            return;
        }
        (s.gfx.clone(), s.self_weak.clone())
    };
    gfx.images.make_stale_if_depending_on(&self_weak);
    let mut s = state.borrow_mut();
    if let Some(t) = &s.texture {
        gfx.driver
            .replace_pixels(t.resource(), None, region(0, 0, s.width, s.height));
    }
    s.base_pixels = None;
    s.history.clear();
    s.stale = false;
}

fn restore_state<C: GpuContext + ?Sized>(state: &Rc<RefCell<State<C>>>) -> Result<(), Error> {
    let (gfx, width, height, screen, volatile, stale) = {
        let s = state.borrow();
        (s.gfx.clone(), s.width, s.height, s.screen, s.volatile, s.stale)
    };

    if screen {
        let t = Texture::new_screen_framebuffer(&gfx.driver, width, height)
            .map_err(|e| Error::Driver(Box::new(e)))?;
        let mut s = state.borrow_mut();
        s.texture = Some(t);
        s.base_pixels = None;
        s.history.clear();
        s.stale = false;
        return Ok(());
    }
    if volatile {
        let t = Texture::new(&gfx.driver, width, height).map_err(|e| Error::Driver(Box::new(e)))?;
        let mut s = state.borrow_mut();
        s.texture = Some(t);
        s.base_pixels = None;
        s.history.clear();
        s.stale = false;
        return Ok(());
    }
    if stale {
        return Err(Error::StaleRestore);
    }

    let t = Texture::new(&gfx.driver, width, height).map_err(|e| Error::Driver(Box::new(e)))?;
    let (base, history) = {
        let mut s = state.borrow_mut();
        (s.base_pixels.take(), std::mem::take(&mut s.history))
    };
    if let Some(p) = &base {
        gfx.driver
            .replace_pixels(t.resource(), Some(p), region(0, 0, width, height));
    }
    for entry in &history {
        match entry {
            HistoryEntry::Pixels { pixels, region } => {
                gfx.driver
                    .replace_pixels(t.resource(), pixels.as_deref(), *region);
            }
            HistoryEntry::Draw {
                source,
                vertices,
                indices,
                color_matrix,
                mode,
                filter,
                address,
            } => {
                // Sources come earlier in the restore order, so their
                // textures are already fresh.
                if let Some(src) = source.upgrade() {
                    let sb = src.borrow();
                    if let Some(st) = &sb.texture {
                        gfx.driver.draw_triangles(
                            t.resource(),
                            st.resource(),
                            vertices,
                            indices,
                            color_matrix.as_ref(),
                            *mode,
                            *filter,
                            *address,
                        );
                    }
                }
            }
        }
    }

    let mut s = state.borrow_mut();
    s.texture = Some(t);
    s.stale = false;
    if history.is_empty() {
        s.base_pixels = base;
    } else {
        // Consolidate the replayed history into a fresh base snapshot.
        s.read_pixels_from_gpu();
    }
    Ok(())
}
