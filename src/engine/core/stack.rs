// SPDX-License-Identifier: MIT
// Copyright (c) 2025 TREX contributors

// ABOUTME: Vertical soil/sediment layer column with burial (push), scour (pop), and collapse
// ABOUTME: Keeps the layer discretization legal as the surface layer grows and shrinks

use super::units::GRAMS_PER_KILOGRAM;

/// One soil or sediment layer.
///
/// Layers are numbered 1..=nstack from the bottom of the column; the
/// surface layer (index nstack) is the only layer exchanging mass with
/// the water column. Water-column state is held outside the column and
/// addressed as layer 0 by the state arrays and ledgers.
///
/// Volume, solids, and chems carry the current (time t) state; the
/// `*_new` fields are the t+dt buffers written by the balance stages and
/// folded in by `StackColumn::advance`.
#[derive(Clone, Debug)]
pub struct Layer {
    /// Layer thickness (m).
    pub thickness: f64,
    /// Horizontal area (m2): cell area overland, bed area in channels
    /// (which may differ layer to layer).
    pub area: f64,
    /// Channel bottom width at this layer (m); cell pitch overland.
    pub bottom_width: f64,
    pub porosity: f64,
    /// Layer volume (m3).
    pub volume: f64,
    /// Volume buffer for the next step (m3).
    pub new_volume: f64,
    pub min_volume: f64,
    pub max_volume: f64,
    /// Elevation of the layer's top interface (m).
    pub elevation: f64,
    /// Solids concentration per fraction (g/m3 of layer volume).
    pub solids: Vec<f64>,
    pub solids_new: Vec<f64>,
    /// Chemical concentration per species (g/m3 of layer volume).
    pub chems: Vec<f64>,
    pub chems_new: Vec<f64>,
}

impl Layer {
    /// Construct a layer spec from geometry and concentrations; volume,
    /// thresholds, and elevation are derived by `StackColumn::new`.
    pub fn spec(
        thickness: f64,
        area: f64,
        bottom_width: f64,
        porosity: f64,
        solids: Vec<f64>,
        chems: Vec<f64>,
    ) -> Self {
        let solids_new = solids.clone();
        let chems_new = chems.clone();
        Self {
            thickness,
            area,
            bottom_width,
            porosity,
            volume: 0.0,
            new_volume: 0.0,
            min_volume: 0.0,
            max_volume: 0.0,
            elevation: 0.0,
            solids,
            solids_new,
            chems,
            chems_new,
        }
    }

    /// Total solids concentration (g/m3).
    pub fn total_solids(&self) -> f64 {
        self.solids.iter().sum()
    }

    pub fn solid_mass(&self, fraction: usize) -> f64 {
        self.solids[fraction] * self.volume
    }

    pub fn chem_mass(&self, species: usize) -> f64 {
        self.chems[species] * self.volume
    }
}

/// Mass moved between two layers by a re-indexing operation, for the
/// burial/scour ledgers. Layer indices are 1-based column positions.
#[derive(Clone, Debug)]
pub struct MassTransfer {
    pub from_layer: usize,
    pub to_layer: usize,
    /// Per-fraction mass (kg).
    pub solids_kg: Vec<f64>,
    /// Per-species mass (kg).
    pub chems_kg: Vec<f64>,
}

/// Result of a push, including any collapse that made room for it.
#[derive(Clone, Debug)]
pub struct PushReport {
    pub collapsed: bool,
    /// Burial transfers: collapse shifts first if any, then the split.
    pub transfers: Vec<MassTransfer>,
    /// Bed (surface) elevation after the push (m).
    pub new_bed_elevation: f64,
    /// Bottom width of the new surface layer (m).
    pub new_bottom_width: f64,
}

/// Result of a pop (scour merge).
#[derive(Clone, Debug)]
pub struct PopReport {
    pub transfer: MassTransfer,
    pub new_bed_elevation: f64,
    pub new_bottom_width: f64,
}

/// The stack is full and may not grow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackFullError {
    pub nstack: usize,
    pub max_stack: usize,
}

/// A bounded column of layers with an active length, the stored initial
/// geometry per position for restoration on push, and the volume-trigger
/// thresholds.
#[derive(Clone, Debug)]
pub struct StackColumn {
    /// Layers bottom-first; only the first `nstack` entries are active.
    layers: Vec<Layer>,
    nstack: usize,
    /// Initial geometry per position (1-based position k at index k-1).
    initial: Vec<Layer>,
    nstack0: usize,
    max_stack: usize,
    /// Volume-trigger factors applied to a layer's reference volume.
    min_volume_factor: f64,
    max_volume_factor: f64,
    /// Elevation of the bottom layer's lower interface (m).
    base_elevation: f64,
}

impl StackColumn {
    /// Build a column from bottom-first layer specs. Volumes, thresholds,
    /// and interface elevations are derived; `base_elevation` is the
    /// elevation of the bottom layer's lower interface.
    pub fn new(
        mut layers: Vec<Layer>,
        base_elevation: f64,
        max_stack: usize,
        min_volume_factor: f64,
        max_volume_factor: f64,
    ) -> Self {
        assert!(!layers.is_empty(), "a stack column needs at least one layer");
        assert!(layers.len() <= max_stack);
        assert!(0.0 < min_volume_factor && min_volume_factor < max_volume_factor);
        let mut elev = base_elevation;
        for layer in layers.iter_mut() {
            layer.volume = layer.area * layer.thickness;
            layer.new_volume = layer.volume;
            layer.min_volume = min_volume_factor * layer.volume;
            layer.max_volume = max_volume_factor * layer.volume;
            elev += layer.thickness;
            layer.elevation = elev;
        }
        let nstack = layers.len();
        let initial = layers.clone();
        layers.reserve_exact(max_stack - layers.len());
        Self {
            layers,
            nstack,
            initial,
            nstack0: nstack,
            max_stack,
            min_volume_factor,
            max_volume_factor,
            base_elevation,
        }
    }

    #[inline]
    pub fn nstack(&self) -> usize {
        self.nstack
    }

    #[inline]
    pub fn nstack0(&self) -> usize {
        self.nstack0
    }

    #[inline]
    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    /// Layer at 1-based position k (1 = bottom, nstack = surface).
    pub fn layer(&self, k: usize) -> &Layer {
        debug_assert!(k >= 1 && k <= self.nstack);
        &self.layers[k - 1]
    }

    pub fn layer_mut(&mut self, k: usize) -> &mut Layer {
        debug_assert!(k >= 1 && k <= self.nstack);
        &mut self.layers[k - 1]
    }

    pub fn surface(&self) -> &Layer {
        &self.layers[self.nstack - 1]
    }

    pub fn surface_mut(&mut self) -> &mut Layer {
        &mut self.layers[self.nstack - 1]
    }

    /// Surface (bed) elevation of the column (m).
    pub fn bed_elevation(&self) -> f64 {
        self.surface().elevation
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &Layer> {
        self.layers[..self.nstack].iter()
    }

    /// Total mass of one solids fraction over the active column (g).
    pub fn total_solid_mass(&self, fraction: usize) -> f64 {
        self.iter_active().map(|l| l.solid_mass(fraction)).sum()
    }

    /// Total mass of one chemical species over the active column (g).
    pub fn total_chem_mass(&self, species: usize) -> f64 {
        self.iter_active().map(|l| l.chem_mass(species)).sum()
    }

    /// Fold the t+dt buffers into the current state. Only the surface
    /// layer changes volume between re-indexings, so the interface
    /// elevation chain stays consistent.
    pub fn advance(&mut self) {
        for layer in self.layers[..self.nstack].iter_mut() {
            if layer.new_volume != layer.volume {
                let new_thickness = layer.new_volume / layer.area;
                layer.elevation += new_thickness - layer.thickness;
                layer.thickness = new_thickness;
                layer.volume = layer.new_volume;
            }
            layer.solids.copy_from_slice(&layer.solids_new);
            layer.chems.copy_from_slice(&layer.chems_new);
        }
    }

    /// Recompute every interface elevation from the column base.
    fn rebuild_elevations(&mut self) {
        let mut elev = self.base_elevation;
        for layer in self.layers[..self.nstack].iter_mut() {
            elev += layer.thickness;
            layer.elevation = elev;
        }
    }

    /// Split the surface layer if its volume exceeds the trigger. When the
    /// column is at capacity, the bottom two layers are first collapsed if
    /// allowed; otherwise the column reports itself full.
    ///
    /// The split re-creates a layer position: below the initial footprint
    /// the position's stored original geometry is restored and the surplus
    /// volume becomes the new surface layer; above it, geometry is cloned
    /// from the initial surface position. The mass remaining in the lower
    /// half is charged as burial out of the surface position into the
    /// subsurface position.
    pub fn maybe_push(
        &mut self,
        collapse_allowed: bool,
    ) -> Result<Option<PushReport>, StackFullError> {
        if self.surface().volume <= self.surface().max_volume {
            return Ok(None);
        }

        let mut transfers = Vec::new();
        let mut collapsed = false;
        if self.nstack == self.max_stack {
            if collapse_allowed && self.max_stack > 2 {
                self.collapse(&mut transfers);
                collapsed = true;
            } else {
                return Err(StackFullError {
                    nstack: self.nstack,
                    max_stack: self.max_stack,
                });
            }
        }

        // 1-based position of the new surface layer; geometry templates
        // come from the position itself inside the initial footprint and
        // from the initial surface position above it
        let new_pos = self.nstack + 1;
        let pushed_pos = self.nstack;
        let template = self.initial[new_pos.min(self.nstack0) - 1].clone();
        let pushed_template = if new_pos <= self.nstack0 {
            self.initial[pushed_pos - 1].clone()
        } else {
            self.initial[self.nstack0 - 1].clone()
        };

        let pushed = &mut self.layers[pushed_pos - 1];
        let surplus_volume = pushed.volume - pushed_template.volume;
        let solids = pushed.solids.clone();
        let chems = pushed.chems.clone();

        // restore the pushed layer to its reference geometry; the surplus
        // moves up into the new surface layer
        pushed.volume = pushed_template.volume;
        pushed.new_volume = pushed_template.volume;
        pushed.area = pushed_template.area;
        pushed.bottom_width = pushed_template.bottom_width;
        pushed.thickness = pushed_template.thickness;
        pushed.min_volume = self.min_volume_factor * pushed_template.volume;
        pushed.max_volume = self.max_volume_factor * pushed_template.volume;

        // burial: the mass left in the lower half leaves the surface
        // position and enters the subsurface position
        let solids_kg: Vec<f64> = solids
            .iter()
            .map(|c| c * pushed_template.volume / GRAMS_PER_KILOGRAM)
            .collect();
        let chems_kg: Vec<f64> = chems
            .iter()
            .map(|c| c * pushed_template.volume / GRAMS_PER_KILOGRAM)
            .collect();

        let new_surface = Layer {
            thickness: surplus_volume / template.area,
            area: template.area,
            bottom_width: template.bottom_width,
            porosity: template.porosity,
            volume: surplus_volume,
            new_volume: surplus_volume,
            min_volume: self.min_volume_factor * template.volume,
            max_volume: self.max_volume_factor * template.volume,
            elevation: 0.0,
            solids_new: solids.clone(),
            chems_new: chems.clone(),
            solids,
            chems,
        };

        if self.layers.len() >= new_pos {
            self.layers[new_pos - 1] = new_surface;
        } else {
            self.layers.push(new_surface);
        }
        self.nstack += 1;
        self.rebuild_elevations();

        transfers.push(MassTransfer {
            from_layer: new_pos,
            to_layer: pushed_pos,
            solids_kg,
            chems_kg,
        });

        Ok(Some(PushReport {
            collapsed,
            transfers,
            new_bed_elevation: self.bed_elevation(),
            new_bottom_width: self.surface().bottom_width,
        }))
    }

    /// Merge the surface layer into the layer below it if its volume has
    /// fallen under the trigger. The residual mass is charged as scour out
    /// of the surface position into the position that becomes the new
    /// surface.
    pub fn maybe_pop(&mut self) -> Option<PopReport> {
        if self.nstack < 2 || self.surface().volume >= self.surface().min_volume {
            return None;
        }

        let top_pos = self.nstack;
        let lower_pos = self.nstack - 1;
        let top = self.layers[top_pos - 1].clone();

        let solids_kg: Vec<f64> = top
            .solids
            .iter()
            .map(|c| c * top.volume / GRAMS_PER_KILOGRAM)
            .collect();
        let chems_kg: Vec<f64> = top
            .chems
            .iter()
            .map(|c| c * top.volume / GRAMS_PER_KILOGRAM)
            .collect();

        let lower = &mut self.layers[lower_pos - 1];
        let combined_volume = lower.volume + top.volume;
        if combined_volume > 0.0 {
            for (s, c) in lower.solids.iter_mut().enumerate() {
                *c = (*c * lower.volume + top.solids[s] * top.volume) / combined_volume;
            }
            for (s, c) in lower.chems.iter_mut().enumerate() {
                *c = (*c * lower.volume + top.chems[s] * top.volume) / combined_volume;
            }
        }
        lower.volume = combined_volume;
        lower.new_volume = combined_volume;
        lower.thickness = combined_volume / lower.area;
        lower.solids_new.copy_from_slice(&lower.solids);
        lower.chems_new.copy_from_slice(&lower.chems);

        self.nstack -= 1;
        self.rebuild_elevations();

        Some(PopReport {
            transfer: MassTransfer {
                from_layer: top_pos,
                to_layer: lower_pos,
                solids_kg,
                chems_kg,
            },
            new_bed_elevation: self.bed_elevation(),
            new_bottom_width: self.surface().bottom_width,
        })
    }

    /// Merge the bottom two layers to free one position, shifting the
    /// layers above down one slot. The merged layer keeps the lower
    /// layer's bed area; its volume triggers are reset against the
    /// combined volume.
    fn collapse(&mut self, transfers: &mut Vec<MassTransfer>) {
        debug_assert!(self.nstack >= 3);

        let upper = self.layers[1].clone();
        let lower = &mut self.layers[0];
        let combined_volume = lower.volume + upper.volume;

        let solids_kg: Vec<f64> = upper
            .solids
            .iter()
            .map(|c| c * upper.volume / GRAMS_PER_KILOGRAM)
            .collect();
        let chems_kg: Vec<f64> = upper
            .chems
            .iter()
            .map(|c| c * upper.volume / GRAMS_PER_KILOGRAM)
            .collect();

        if combined_volume > 0.0 {
            for (s, c) in lower.solids.iter_mut().enumerate() {
                *c = (*c * lower.volume + upper.solids[s] * upper.volume) / combined_volume;
            }
            for (s, c) in lower.chems.iter_mut().enumerate() {
                *c = (*c * lower.volume + upper.chems[s] * upper.volume) / combined_volume;
            }
        }
        lower.volume = combined_volume;
        lower.new_volume = combined_volume;
        lower.thickness = combined_volume / lower.area;
        lower.min_volume = self.min_volume_factor * combined_volume;
        lower.max_volume = self.max_volume_factor * combined_volume;
        lower.solids_new.copy_from_slice(&lower.solids);
        lower.chems_new.copy_from_slice(&lower.chems);

        transfers.push(MassTransfer {
            from_layer: 2,
            to_layer: 1,
            solids_kg,
            chems_kg,
        });

        // shift positions 3..=nstack down one slot; the full mass of each
        // shifted layer is charged as burial into the position below
        for k in 3..=self.nstack {
            let shifted = self.layers[k - 1].clone();
            transfers.push(MassTransfer {
                from_layer: k,
                to_layer: k - 1,
                solids_kg: shifted
                    .solids
                    .iter()
                    .map(|c| c * shifted.volume / GRAMS_PER_KILOGRAM)
                    .collect(),
                chems_kg: shifted
                    .chems
                    .iter()
                    .map(|c| c * shifted.volume / GRAMS_PER_KILOGRAM)
                    .collect(),
            });
            self.layers[k - 2] = shifted;
        }
        self.nstack -= 1;
        self.rebuild_elevations();
    }

    /// Rebuild the active layers from restart state: per-layer volumes
    /// and concentrations, bottom-first. Geometry comes from the stored
    /// position templates, exactly as a push would restore it.
    pub fn restore(&mut self, volumes: &[f64], solids: &[Vec<f64>], chems: &[Vec<f64>]) {
        let nstack = volumes.len();
        assert!(nstack >= 1 && nstack <= self.max_stack);
        assert_eq!(solids.len(), nstack);
        assert_eq!(chems.len(), nstack);
        self.layers.truncate(0);
        for k in 1..=nstack {
            let template = self.initial[k.min(self.nstack0) - 1].clone();
            let volume = volumes[k - 1];
            self.layers.push(Layer {
                thickness: volume / template.area,
                area: template.area,
                bottom_width: template.bottom_width,
                porosity: template.porosity,
                volume,
                new_volume: volume,
                min_volume: self.min_volume_factor * template.volume,
                max_volume: self.max_volume_factor * template.volume,
                elevation: 0.0,
                solids_new: solids[k - 1].clone(),
                chems_new: chems[k - 1].clone(),
                solids: solids[k - 1].clone(),
                chems: chems[k - 1].clone(),
            });
        }
        self.nstack = nstack;
        self.rebuild_elevations();
    }

    /// Debug check of the structural invariants; used by tests.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        assert!(self.nstack >= 1 && self.nstack <= self.max_stack);
        let mut elev = self.base_elevation;
        for k in 1..=self.nstack {
            let layer = self.layer(k);
            assert!(layer.min_volume > 0.0 && layer.min_volume < layer.max_volume);
            assert!(
                (layer.volume - layer.area * layer.thickness).abs()
                    <= 1.0e-4 * layer.volume.max(1.0e-30)
            );
            elev += layer.thickness;
            assert!(
                (layer.elevation - elev).abs() < 1.0e-9,
                "layer {} elevation {} inconsistent with chain {}",
                k,
                layer.elevation,
                elev
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(n_layers: usize, max_stack: usize) -> StackColumn {
        let layers = (0..n_layers)
            .map(|_| {
                Layer::spec(
                    0.1,
                    100.0,
                    10.0,
                    0.4,
                    vec![1.0e5, 5.0e4],
                    vec![10.0],
                )
            })
            .collect();
        StackColumn::new(layers, 90.0, max_stack, 0.5, 1.5)
    }

    fn total_mass(col: &StackColumn) -> (Vec<f64>, Vec<f64>) {
        let ns = col.surface().solids.len();
        let nc = col.surface().chems.len();
        (
            (0..ns).map(|s| col.total_solid_mass(s)).collect(),
            (0..nc).map(|s| col.total_chem_mass(s)).collect(),
        )
    }

    /// Grow or shrink the surface layer through the t+dt buffers the way
    /// the solids balance does, then fold the change in.
    fn scale_surface(col: &mut StackColumn, factor: f64) {
        let surface = col.surface_mut();
        surface.new_volume = surface.volume * factor;
        col.advance();
    }

    #[test]
    fn test_construction_derives_geometry() {
        let col = column(3, 5);
        assert_eq!(col.nstack(), 3);
        assert!((col.layer(1).volume - 10.0).abs() < 1.0e-12);
        assert!((col.layer(1).elevation - 90.1).abs() < 1.0e-12);
        assert!((col.bed_elevation() - 90.3).abs() < 1.0e-12);
        col.check_invariants();
    }

    #[test]
    fn test_advance_folds_new_buffers() {
        let mut col = column(2, 5);
        {
            let surface = col.surface_mut();
            surface.new_volume = 12.0;
            surface.solids_new[0] = 2.0e5;
        }
        col.advance();
        assert!((col.surface().volume - 12.0).abs() < 1.0e-12);
        assert!((col.surface().thickness - 0.12).abs() < 1.0e-12);
        assert_eq!(col.surface().solids[0], 2.0e5);
        col.check_invariants();
    }

    #[test]
    fn test_no_push_below_trigger() {
        let mut col = column(2, 5);
        assert!(col.maybe_push(false).unwrap().is_none());
        assert_eq!(col.nstack(), 2);
    }

    #[test]
    fn test_push_splits_surface_layer() {
        let mut col = column(2, 5);
        scale_surface(&mut col, 1.6);
        let (solids_before, chems_before) = total_mass(&col);

        let report = col.maybe_push(false).unwrap().expect("push required");
        assert!(!report.collapsed);
        assert_eq!(col.nstack(), 3);
        // the pushed layer is restored to its reference volume
        assert!((col.layer(2).volume - 10.0).abs() < 1.0e-9);
        // the new surface carries the surplus
        assert!((col.surface().volume - 6.0).abs() < 1.0e-9);
        col.check_invariants();

        let (solids_after, chems_after) = total_mass(&col);
        for (b, a) in solids_before
            .iter()
            .zip(&solids_after)
            .chain(chems_before.iter().zip(&chems_after))
        {
            assert!((b - a).abs() <= 1.0e-9 * b.max(1.0));
        }

        // burial symmetry: mass out of the surface position equals mass
        // into the subsurface position
        let t = &report.transfers[0];
        assert_eq!(t.from_layer, 3);
        assert_eq!(t.to_layer, 2);
        assert!((t.solids_kg[0] - 1.0e5 * 10.0 / 1000.0).abs() < 1.0e-9);
    }

    #[test]
    fn test_push_above_initial_footprint_clones_surface_geometry() {
        let mut col = column(2, 6);
        for _ in 0..3 {
            let max_volume = col.surface().max_volume;
            let factor = max_volume * 1.1 / col.surface().volume;
            scale_surface(&mut col, factor);
            col.maybe_push(false).unwrap().expect("push required");
            col.check_invariants();
        }
        assert_eq!(col.nstack(), 5);
        // geometry above the initial footprint comes from the initial
        // surface position
        assert!((col.layer(4).area - 100.0).abs() < 1.0e-12);
        assert!((col.layer(4).porosity - 0.4).abs() < 1.0e-12);
    }

    #[test]
    fn test_pop_merges_surface_into_lower() {
        let mut col = column(3, 5);
        // scour has shrunk the surface layer to 30% of its reference
        scale_surface(&mut col, 0.3);
        let (solids_before, chems_before) = total_mass(&col);

        let report = col.maybe_pop().expect("pop required");
        assert_eq!(col.nstack(), 2);
        assert_eq!(report.transfer.from_layer, 3);
        assert_eq!(report.transfer.to_layer, 2);
        // residual mass of the merged surface, in kg
        assert!((report.transfer.solids_kg[0] - 1.0e5 * 3.0 / 1000.0).abs() < 1.0e-9);
        col.check_invariants();

        let (solids_after, chems_after) = total_mass(&col);
        for (b, a) in solids_before
            .iter()
            .zip(&solids_after)
            .chain(chems_before.iter().zip(&chems_after))
        {
            assert!((b - a).abs() <= 1.0e-9 * b.max(1.0));
        }
        // the new surface absorbed the residual volume
        assert!((col.surface().volume - 13.0).abs() < 1.0e-9);
    }

    #[test]
    fn test_push_pop_roundtrip_restores_nstack() {
        let mut col = column(2, 5);
        scale_surface(&mut col, 1.51);
        col.maybe_push(false).unwrap().expect("push");
        assert_eq!(col.nstack(), 3);

        let factor = col.surface().min_volume * 0.5 / col.surface().volume;
        scale_surface(&mut col, factor);
        col.maybe_pop().expect("pop");
        assert_eq!(col.nstack(), 2);
        col.check_invariants();
    }

    #[test]
    fn test_stack_full_without_collapse() {
        let mut col = column(3, 3);
        scale_surface(&mut col, 1.6);
        let err = col.maybe_push(false).unwrap_err();
        assert_eq!(err.nstack, 3);
        assert_eq!(err.max_stack, 3);
    }

    #[test]
    fn test_collapse_frees_slot_and_conserves_mass() {
        let mut col = column(3, 3);
        scale_surface(&mut col, 1.8);
        let (solids_before, chems_before) = total_mass(&col);

        let report = col.maybe_push(true).unwrap().expect("push with collapse");
        assert!(report.collapsed);
        assert_eq!(col.nstack(), 3);
        // bottom layer holds the merged volume of the old bottom two
        assert!((col.layer(1).volume - 20.0).abs() < 1.0e-9);

        let (solids_after, chems_after) = total_mass(&col);
        for (b, a) in solids_before
            .iter()
            .zip(&solids_after)
            .chain(chems_before.iter().zip(&chems_after))
        {
            assert!((b - a).abs() <= 1.0e-9 * b.max(1.0));
        }
        col.check_invariants();
    }

    #[test]
    fn test_collapse_keeps_lower_bed_area() {
        let layers = vec![
            Layer::spec(0.2, 120.0, 12.0, 0.4, vec![1.0e5], vec![0.0]),
            Layer::spec(0.1, 100.0, 10.0, 0.4, vec![1.0e5], vec![0.0]),
            Layer::spec(0.1, 100.0, 10.0, 0.4, vec![1.0e5], vec![0.0]),
        ];
        let mut col = StackColumn::new(layers, 90.0, 3, 0.5, 1.5);
        scale_surface(&mut col, 1.8);
        col.maybe_push(true).unwrap().expect("push with collapse");
        assert!((col.layer(1).area - 120.0).abs() < 1.0e-12);
        assert!((col.layer(1).bottom_width - 12.0).abs() < 1.0e-12);
        col.check_invariants();
    }

    #[test]
    fn test_collapse_charges_burial_for_shifted_layers() {
        let mut col = column(3, 3);
        scale_surface(&mut col, 1.8);
        let report = col.maybe_push(true).unwrap().unwrap();
        // merge 2->1, shift 3->2, then the split itself
        assert_eq!(report.transfers.len(), 3);
        assert_eq!(
            (report.transfers[0].from_layer, report.transfers[0].to_layer),
            (2, 1)
        );
        assert_eq!(
            (report.transfers[1].from_layer, report.transfers[1].to_layer),
            (3, 2)
        );
    }
}
