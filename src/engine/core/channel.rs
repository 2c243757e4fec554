// SPDX-License-Identifier: MIT
// Copyright (c) 2025 TREX contributors

// ABOUTME: One-dimensional channel network embedded in the overland grid
// ABOUTME: Links of ordered nodes with trapezoidal geometry, junction topology, and cell binding

use super::error::{Result, TrexError};
use super::grid::{CellMask, Grid};

/// A (link, node) reference used for junction topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Connection {
    pub link: usize,
    pub node: usize,
}

/// Geometry of one channel node. Bank height and bed elevation are
/// mutated by the stack re-indexing as the bed aggrades or degrades.
#[derive(Clone, Debug)]
pub struct NodeGeometry {
    /// Channel bottom width (m).
    pub bottom_width: f64,
    /// Bank height: overland ground surface minus channel bed (m).
    pub bank_height: f64,
    /// Side slope as run per unit rise; 0 gives a rectangular section.
    pub side_slope: f64,
    /// Node length along the thalweg, including sinuosity (m).
    pub length: f64,
    /// Manning roughness for the node.
    pub manning_n: f64,
    /// Bed slope along the link (m/m).
    pub bed_slope: f64,
    /// Channel bed elevation (m).
    pub bed_elevation: f64,
    /// Sediment type id for erosion properties.
    pub sediment_type: usize,
}

impl NodeGeometry {
    /// Top width at bankfull, derived from the trapezoid.
    pub fn top_width(&self) -> f64 {
        self.bottom_width + 2.0 * self.side_slope * self.bank_height
    }

    /// Flow area for a water depth (m2). Depth above bankfull spreads at
    /// the bankfull top width; the surplus volume is the floodplain's.
    pub fn flow_area(&self, depth: f64) -> f64 {
        let h = depth.min(self.bank_height).max(0.0);
        let mut area = self.bottom_width * h + self.side_slope * h * h;
        if depth > self.bank_height {
            area += (depth - self.bank_height) * self.top_width();
        }
        area
    }

    /// Wetted perimeter for a water depth (m).
    pub fn wetted_perimeter(&self, depth: f64) -> f64 {
        let h = depth.min(self.bank_height).max(0.0);
        self.bottom_width + 2.0 * h * (1.0 + self.side_slope * self.side_slope).sqrt()
    }

    pub fn hydraulic_radius(&self, depth: f64) -> f64 {
        let p = self.wetted_perimeter(depth);
        if p > 0.0 {
            self.flow_area(depth) / p
        } else {
            0.0
        }
    }

    /// Water surface width for a depth (m), for rain capture and
    /// deposition area.
    pub fn surface_width(&self, depth: f64) -> f64 {
        let h = depth.min(self.bank_height).max(0.0);
        (self.bottom_width + 2.0 * self.side_slope * h).max(self.bottom_width)
    }

    /// Invert the trapezoid: the depth whose flow area equals `area`.
    pub fn depth_from_area(&self, area: f64) -> f64 {
        if area <= 0.0 {
            return 0.0;
        }
        let bankfull = self.bottom_width * self.bank_height
            + self.side_slope * self.bank_height * self.bank_height;
        if area > bankfull {
            return self.bank_height + (area - bankfull) / self.top_width();
        }
        if self.side_slope > 0.0 {
            let b = self.bottom_width;
            let z = self.side_slope;
            (-b + (b * b + 4.0 * z * area).sqrt()) / (2.0 * z)
        } else {
            area / self.bottom_width
        }
    }

    /// Water volume held at a depth (m3).
    pub fn water_volume(&self, depth: f64) -> f64 {
        self.flow_area(depth) * self.length
    }
}

/// An ordered reach of nodes between junctions. Flow runs from node 0 to
/// the last node; junction connections attach at either end.
#[derive(Clone, Debug)]
pub struct Link {
    pub nodes: Vec<NodeGeometry>,
    /// Overland cell bound to each node.
    pub cells: Vec<(usize, usize)>,
    /// Links feeding node 0 (their last nodes discharge here).
    pub upstream: Vec<Connection>,
    /// Links receiving the last node's discharge. Empty for terminal
    /// (outlet) links.
    pub downstream: Vec<Connection>,
}

/// The channel network: ordered links, flat node indexing for the state
/// arrays, and the node-to-cell bijection over channel-masked cells.
#[derive(Clone, Debug)]
pub struct ChannelNetwork {
    pub links: Vec<Link>,
    offsets: Vec<usize>,
    total_nodes: usize,
}

impl ChannelNetwork {
    pub fn new(links: Vec<Link>) -> Self {
        let mut offsets = Vec::with_capacity(links.len());
        let mut total = 0;
        for link in &links {
            offsets.push(total);
            total += link.nodes.len();
        }
        Self {
            links,
            offsets,
            total_nodes: total,
        }
    }

    /// An empty network for runs without channels.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.total_nodes == 0
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn node_count(&self) -> usize {
        self.total_nodes
    }

    /// Flat index of a node for state arrays sized node_count().
    #[inline]
    pub fn node_index(&self, link: usize, node: usize) -> usize {
        debug_assert!(node < self.links[link].nodes.len());
        self.offsets[link] + node
    }

    pub fn node(&self, link: usize, node: usize) -> &NodeGeometry {
        &self.links[link].nodes[node]
    }

    pub fn node_mut(&mut self, link: usize, node: usize) -> &mut NodeGeometry {
        &mut self.links[link].nodes[node]
    }

    /// Overland cell bound to a node.
    pub fn cell_of(&self, link: usize, node: usize) -> (usize, usize) {
        self.links[link].cells[node]
    }

    /// Terminal links discharge across the domain boundary.
    pub fn is_terminal(&self, link: usize) -> bool {
        self.links[link].downstream.is_empty()
    }

    /// Iterator over (link, node, flat index).
    pub fn iter_nodes(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.links.iter().enumerate().flat_map(move |(l, link)| {
            (0..link.nodes.len()).map(move |n| (l, n, self.offsets[l] + n))
        })
    }

    /// Check topology against the grid: every channel-masked cell is bound
    /// to exactly one node, every node sits on a channel-masked cell, and
    /// junction connections reference real nodes.
    pub fn validate(&self, grid: &Grid) -> Result<()> {
        let mut bound = vec![false; grid.cell_count()];
        for (l, n, _) in self.iter_nodes() {
            let (row, col) = self.cell_of(l, n);
            if row >= grid.rows || col >= grid.cols {
                return Err(TrexError::Validation(format!(
                    "link {} node {} bound to cell ({}, {}) outside the grid",
                    l, n, row, col
                )));
            }
            if grid.mask.get(row, col) != CellMask::Channel {
                return Err(TrexError::Validation(format!(
                    "link {} node {} bound to cell ({}, {}) not masked as channel",
                    l, n, row, col
                )));
            }
            let idx = grid.index(row, col);
            if bound[idx] {
                return Err(TrexError::Validation(format!(
                    "cell ({}, {}) bound to more than one channel node",
                    row, col
                )));
            }
            bound[idx] = true;
        }
        for (r, c) in grid.iter_domain() {
            if grid.mask.get(r, c) == CellMask::Channel && !bound[grid.index(r, c)] {
                return Err(TrexError::Validation(format!(
                    "channel-masked cell ({}, {}) has no channel node",
                    r, c
                )));
            }
        }
        for (l, link) in self.links.iter().enumerate() {
            for conn in link.upstream.iter().chain(link.downstream.iter()) {
                if conn.link >= self.links.len()
                    || conn.node >= self.links[conn.link].nodes.len()
                {
                    return Err(TrexError::Validation(format!(
                        "link {} references missing connection link {} node {}",
                        l, conn.link, conn.node
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(bottom_width: f64, bank_height: f64, side_slope: f64) -> NodeGeometry {
        NodeGeometry {
            bottom_width,
            bank_height,
            side_slope,
            length: 100.0,
            manning_n: 0.03,
            bed_slope: 0.001,
            bed_elevation: 98.0,
            sediment_type: 0,
        }
    }

    #[test]
    fn test_rectangular_section() {
        let node = test_node(2.0, 1.0, 0.0);
        assert_eq!(node.top_width(), 2.0);
        assert!((node.flow_area(0.5) - 1.0).abs() < 1.0e-12);
        assert!((node.wetted_perimeter(0.5) - 3.0).abs() < 1.0e-12);
    }

    #[test]
    fn test_trapezoid_section() {
        let node = test_node(2.0, 1.0, 2.0);
        // A = b*h + z*h^2 at h = 1
        assert!((node.flow_area(1.0) - 4.0).abs() < 1.0e-12);
        assert_eq!(node.top_width(), 6.0);
        // above bankfull the surplus spreads at the bankfull top width
        assert!((node.flow_area(1.5) - (4.0 + 0.5 * 6.0)).abs() < 1.0e-12);
    }

    #[test]
    fn test_flat_node_indexing() {
        let link0 = Link {
            nodes: vec![test_node(1.0, 1.0, 0.0); 3],
            cells: vec![(0, 0), (0, 1), (0, 2)],
            upstream: vec![],
            downstream: vec![Connection { link: 1, node: 0 }],
        };
        let link1 = Link {
            nodes: vec![test_node(1.0, 1.0, 0.0); 2],
            cells: vec![(1, 2), (2, 2)],
            upstream: vec![Connection { link: 0, node: 2 }],
            downstream: vec![],
        };
        let net = ChannelNetwork::new(vec![link0, link1]);
        assert_eq!(net.node_count(), 5);
        assert_eq!(net.node_index(0, 0), 0);
        assert_eq!(net.node_index(1, 0), 3);
        assert_eq!(net.node_index(1, 1), 4);
        assert!(net.is_terminal(1));
        assert!(!net.is_terminal(0));
    }

    #[test]
    fn test_validate_detects_unbound_channel_cell() {
        let mut grid = Grid::uniform(1, 3, 10.0, 100.0);
        grid.mask.set(0, 0, CellMask::Channel);
        grid.mask.set(0, 1, CellMask::Channel);
        let link = Link {
            nodes: vec![test_node(1.0, 1.0, 0.0)],
            cells: vec![(0, 0)],
            upstream: vec![],
            downstream: vec![],
        };
        let net = ChannelNetwork::new(vec![link]);
        assert!(net.validate(&grid).is_err());
    }
}
