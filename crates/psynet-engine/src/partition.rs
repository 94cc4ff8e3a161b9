//! Partition: the per-population compute core
//!
//! A partition owns the element vectors, the weight matrix, the nodespace
//! tree, activator tables, groups and inter-partition link blocks of one
//! population of nodes, and implements the two-phase step over them:
//! linear propagation followed by the non-linear per-element update.

use crate::error::{EngineError, Result};
use crate::gates::{apply_gate, GateParams};
use crate::inlinks::InlinkBlock;
use crate::matrix::WeightMatrix;
use crate::native::{NativeModule, NativeModuleContext};
use crate::nodefn::{dispatch_element, DispatchInputs, ShiftedView};
use crate::types::{
    gate, nodefunction as nf, nodetype, std_elements_per_type, std_gates_per_type,
    std_slots_per_type, GateFunction, GateParameter, NodeParameter,
};

use log::{info, warn};
use psynet_storage::ArrayArchive;
use std::collections::{BTreeMap, HashMap};

/// The root nodespace of every partition
pub const ROOT_NODESPACE: u32 = 1;

/// Pipes wait this long for confirmation unless told otherwise
const DEFAULT_PIPE_WAIT: i16 = 10;

/// Construction parameters for a partition
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Use the CSR weight matrix representation
    pub sparse: bool,
    /// Initial node id capacity
    pub initial_number_of_nodes: usize,
    /// Sizing assumption for the element vectors
    pub average_elements_per_node: usize,
    /// Initial nodespace id capacity
    pub initial_number_of_nodespaces: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            sparse: true,
            initial_number_of_nodes: 2000,
            average_elements_per_node: 5,
            initial_number_of_nodespaces: 10,
        }
    }
}

/// One outgoing link in a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct LinkData {
    /// Source node id
    pub source_node: u32,
    /// Gate index on the source node
    pub source_gate: usize,
    /// Target node id
    pub target_node: u32,
    /// Slot index on the target node
    pub target_slot: usize,
    /// Link weight
    pub weight: f32,
}

/// Snapshot of one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeData {
    /// Node id
    pub id: u32,
    /// Numeric node type
    pub node_type: i32,
    /// Parent nodespace
    pub parent_nodespace: u32,
    /// Gate activations, one per element
    pub activations: Vec<f32>,
    /// Outgoing links, if requested
    pub links: Vec<LinkData>,
}

/// Result of a snapshot query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeDataResult {
    /// Selected nodes
    pub nodes: Vec<NodeData>,
    /// Nodes linked to or from the selection but not part of it
    pub followup_ids: Vec<u32>,
}

/// A population of nodes with its complete numerical state
#[derive(Debug)]
pub struct Partition {
    pid: u32,
    sparse: bool,
    non: usize,
    noe: usize,
    nons: usize,

    allocated_nodes: Vec<i32>,
    allocated_node_offsets: Vec<i32>,
    allocated_elements_to_nodes: Vec<i32>,
    allocated_node_parents: Vec<i32>,
    allocated_nodespaces: Vec<i32>,
    allocated_elements_to_activators: Vec<i32>,

    // directional activator slots, indexed by gate constant minus one
    nodespace_gate_activators: [Vec<i32>; 6],
    nodespace_sampling_activators: Vec<i32>,

    nodes_last_changed: Vec<i32>,
    nodespaces_last_changed: Vec<i32>,
    nodespaces_contents_last_changed: Vec<i32>,

    w: WeightMatrix,
    a: Vec<f32>,
    a_in: Vec<f32>,
    a_prev: Vec<f32>,

    g_theta: Vec<f32>,
    g_factor: Vec<f32>,
    g_threshold: Vec<f32>,
    g_amplification: Vec<f32>,
    g_min: Vec<f32>,
    g_max: Vec<f32>,
    g_function_selector: Vec<i8>,
    g_expect: Vec<f32>,
    g_countdown: Vec<i16>,
    g_wait: Vec<i16>,

    n_function_selector: Vec<i8>,
    n_node_porlinked: Vec<i8>,
    n_node_retlinked: Vec<i8>,

    sensor_indices: Vec<i32>,
    actuator_indices: Vec<i32>,

    inlinks: BTreeMap<u32, InlinkBlock>,
    nodegroups: HashMap<u32, HashMap<String, Vec<usize>>>,

    native_elements: BTreeMap<i32, usize>,
    native_instances: BTreeMap<u32, Box<dyn NativeModule>>,
    native_slot_snapshots: BTreeMap<u32, Vec<f32>>,
    comments: BTreeMap<u32, String>,

    has_new_usages: bool,
    has_pipes: bool,
    has_lstms: bool,
    has_directional_activators: bool,
    has_sampling_activators: bool,
    has_gatefunction_absolute: bool,
    has_gatefunction_sigmoid: bool,
    has_gatefunction_tanh: bool,
    has_gatefunction_rect: bool,
    has_gatefunction_one_over_x: bool,
    por_ret_dirty: bool,

    last_allocated_node: usize,
    last_allocated_offset: usize,
    last_allocated_nodespace: usize,
}

impl Partition {
    /// Create an empty partition
    pub fn new(pid: u32, config: &PartitionConfig) -> Self {
        let non = config.initial_number_of_nodes.max(2);
        let noe = (non * config.average_elements_per_node).max(16);
        let nons = config.initial_number_of_nodespaces.max(2);

        let mut partition = Self {
            pid,
            sparse: config.sparse,
            non,
            noe,
            nons,
            allocated_nodes: vec![0; non],
            allocated_node_offsets: vec![0; non],
            allocated_elements_to_nodes: vec![0; noe],
            allocated_node_parents: vec![0; non],
            allocated_nodespaces: vec![0; nons],
            allocated_elements_to_activators: vec![0; noe],
            nodespace_gate_activators: std::array::from_fn(|_| vec![0; nons]),
            nodespace_sampling_activators: vec![0; nons],
            nodes_last_changed: vec![-1; non],
            nodespaces_last_changed: vec![-1; nons],
            nodespaces_contents_last_changed: vec![-1; nons],
            w: WeightMatrix::new(noe, config.sparse),
            a: vec![0.0; noe],
            a_in: vec![0.0; noe],
            a_prev: vec![0.0; noe],
            g_theta: vec![0.0; noe],
            g_factor: vec![1.0; noe],
            g_threshold: vec![0.0; noe],
            g_amplification: vec![1.0; noe],
            g_min: vec![0.0; noe],
            g_max: vec![1.0; noe],
            g_function_selector: vec![0; noe],
            g_expect: vec![1.0; noe],
            g_countdown: vec![0; noe],
            g_wait: vec![1; noe],
            n_function_selector: vec![0; noe],
            n_node_porlinked: vec![0; noe],
            n_node_retlinked: vec![0; noe],
            sensor_indices: Vec::new(),
            actuator_indices: Vec::new(),
            inlinks: BTreeMap::new(),
            nodegroups: HashMap::new(),
            native_elements: BTreeMap::new(),
            native_instances: BTreeMap::new(),
            native_slot_snapshots: BTreeMap::new(),
            comments: BTreeMap::new(),
            has_new_usages: true,
            has_pipes: false,
            has_lstms: false,
            has_directional_activators: false,
            has_sampling_activators: false,
            has_gatefunction_absolute: false,
            has_gatefunction_sigmoid: false,
            has_gatefunction_tanh: false,
            has_gatefunction_rect: false,
            has_gatefunction_one_over_x: false,
            por_ret_dirty: true,
            last_allocated_node: 0,
            last_allocated_offset: 0,
            last_allocated_nodespace: 0,
        };
        // the root nodespace is its own parent
        partition.allocated_nodespaces[ROOT_NODESPACE as usize] = ROOT_NODESPACE as i32;
        partition.last_allocated_nodespace = ROOT_NODESPACE as usize;
        partition
    }

    /// Partition id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True if the weight matrix uses the CSR representation
    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    /// Node id capacity
    pub fn number_of_nodes(&self) -> usize {
        self.non
    }

    /// Element capacity
    pub fn number_of_elements(&self) -> usize {
        self.noe
    }

    /// Nodespace id capacity
    pub fn number_of_nodespaces(&self) -> usize {
        self.nons
    }

    /// Current activation vector
    pub fn activations(&self) -> &[f32] {
        &self.a
    }

    /// Current countdown vector
    pub fn countdowns(&self) -> &[i16] {
        &self.g_countdown
    }

    /// Pending external input vector, consumed by the next propagation
    pub fn external_inputs(&self) -> &[f32] {
        &self.a_in
    }

    /// Per-element por-linked flags
    pub fn por_linked_flags(&self) -> &[i8] {
        &self.n_node_porlinked
    }

    /// Per-element ret-linked flags
    pub fn ret_linked_flags(&self) -> &[i8] {
        &self.n_node_retlinked
    }

    /// Number of live nodes
    pub fn live_node_count(&self) -> usize {
        self.allocated_nodes.iter().filter(|&&t| t != 0).count()
    }

    /// Number of elements bound to live nodes
    pub fn used_element_count(&self) -> usize {
        self.allocated_elements_to_nodes
            .iter()
            .filter(|&&id| id != 0)
            .count()
    }

    /// Number of non-zero weights
    pub fn link_count(&self) -> usize {
        self.w.nnz()
    }

    /// Ids of all live nodes
    pub fn node_ids(&self) -> Vec<u32> {
        (0..self.non)
            .filter(|&id| self.allocated_nodes[id] != 0)
            .map(|id| id as u32)
            .collect()
    }

    /// Ids of all live nodespaces
    pub fn nodespace_ids(&self) -> Vec<u32> {
        (0..self.nons)
            .filter(|&id| self.allocated_nodespaces[id] != 0)
            .map(|id| id as u32)
            .collect()
    }

    /// True if the node id refers to a live node
    pub fn is_node_live(&self, node_id: u32) -> bool {
        (node_id as usize) < self.non && self.allocated_nodes[node_id as usize] != 0
    }

    /// True if the nodespace id refers to a live nodespace
    pub fn is_nodespace_live(&self, nodespace_id: u32) -> bool {
        (nodespace_id as usize) < self.nons && self.allocated_nodespaces[nodespace_id as usize] != 0
    }

    /// Numeric type of a live node
    pub fn node_type(&self, node_id: u32) -> Result<i32> {
        if !self.is_node_live(node_id) {
            return Err(EngineError::invalid_node(node_id));
        }
        Ok(self.allocated_nodes[node_id as usize])
    }

    /// Parent nodespace of a live node
    pub fn node_parent(&self, node_id: u32) -> Result<u32> {
        if !self.is_node_live(node_id) {
            return Err(EngineError::invalid_node(node_id));
        }
        Ok(self.allocated_node_parents[node_id as usize] as u32)
    }

    /// First element of a live node
    pub fn node_offset(&self, node_id: u32) -> Result<usize> {
        if !self.is_node_live(node_id) {
            return Err(EngineError::invalid_node(node_id));
        }
        Ok(self.allocated_node_offsets[node_id as usize] as usize)
    }

    /// Element index of one gate of a live node
    pub fn element_index(&self, node_id: u32, gate_index: usize) -> Result<usize> {
        let node_type = self.node_type(node_id)?;
        if gate_index >= self.elements_per_type(node_type)? {
            return Err(EngineError::InvalidGateOrSlot {
                node: node_id,
                channel: "gate",
                index: gate_index,
            });
        }
        Ok(self.allocated_node_offsets[node_id as usize] as usize + gate_index)
    }

    /// Element index of a gate, validated against the node type's gate count
    pub fn gate_element(&self, node_id: u32, gate_index: usize) -> Result<usize> {
        let node_type = self.node_type(node_id)?;
        if gate_index >= self.gates_per_type(node_type)? {
            return Err(EngineError::InvalidGateOrSlot {
                node: node_id,
                channel: "gate",
                index: gate_index,
            });
        }
        Ok(self.allocated_node_offsets[node_id as usize] as usize + gate_index)
    }

    /// Element index of a slot, validated against the node type's slot count
    pub fn slot_element(&self, node_id: u32, slot_index: usize) -> Result<usize> {
        let node_type = self.node_type(node_id)?;
        if slot_index >= self.slots_per_type(node_type)? {
            return Err(EngineError::InvalidGateOrSlot {
                node: node_id,
                channel: "slot",
                index: slot_index,
            });
        }
        Ok(self.allocated_node_offsets[node_id as usize] as usize + slot_index)
    }

    fn elements_per_type(&self, node_type: i32) -> Result<usize> {
        std_elements_per_type(node_type)
            .or_else(|| self.native_elements.get(&node_type).copied())
            .ok_or(EngineError::InvalidType { type_id: node_type })
    }

    fn gates_per_type(&self, node_type: i32) -> Result<usize> {
        std_gates_per_type(node_type)
            .or_else(|| self.native_elements.get(&node_type).copied())
            .ok_or(EngineError::InvalidType { type_id: node_type })
    }

    fn slots_per_type(&self, node_type: i32) -> Result<usize> {
        std_slots_per_type(node_type)
            .or_else(|| self.native_elements.get(&node_type).copied())
            .ok_or(EngineError::InvalidType { type_id: node_type })
    }

    /// Make a native module type known to this partition
    pub fn declare_native_type(&mut self, numeric_type: i32, elements: usize) {
        self.native_elements.insert(numeric_type, elements);
    }

    /// Attach a native module instance to a live node
    pub fn install_native_instance(
        &mut self,
        node_id: u32,
        instance: Box<dyn NativeModule>,
    ) -> Result<()> {
        if !self.is_node_live(node_id) {
            return Err(EngineError::invalid_node(node_id));
        }
        self.native_instances.insert(node_id, instance);
        Ok(())
    }

    /// Attach comment text to a live comment node
    pub fn set_comment_text(&mut self, node_id: u32, text: impl Into<String>) -> Result<()> {
        if self.node_type(node_id)? != nodetype::COMMENT {
            return Err(EngineError::InvalidType {
                type_id: self.allocated_nodes[node_id as usize],
            });
        }
        self.comments.insert(node_id, text.into());
        Ok(())
    }

    /// Comment text of a comment node
    pub fn comment_text(&self, node_id: u32) -> Option<&str> {
        self.comments.get(&node_id).map(String::as_str)
    }

    // -- change tracking ----------------------------------------------------

    fn mark_node_changed(&mut self, node_id: usize, step: i32) {
        if node_id < self.non {
            self.nodes_last_changed[node_id] = step;
            let parent = self.allocated_node_parents[node_id] as usize;
            if parent < self.nons {
                self.nodespaces_contents_last_changed[parent] = step;
            }
        }
    }

    /// True if the direct contents of the nodespace changed at or after `since_step`
    pub fn has_nodespace_changes(&self, nodespace_id: u32, since_step: i32) -> Result<bool> {
        if !self.is_nodespace_live(nodespace_id) {
            return Err(EngineError::invalid_nodespace(nodespace_id));
        }
        Ok(self.nodespaces_contents_last_changed[nodespace_id as usize] >= since_step)
    }

    /// Nodes and child nodespaces of the nodespace changed at or after `since_step`
    pub fn get_nodespace_changes(
        &self,
        nodespace_id: u32,
        since_step: i32,
    ) -> Result<(Vec<u32>, Vec<u32>)> {
        if !self.is_nodespace_live(nodespace_id) {
            return Err(EngineError::invalid_nodespace(nodespace_id));
        }
        let ns = nodespace_id as i32;
        let nodes = (0..self.non)
            .filter(|&id| {
                self.nodes_last_changed[id] >= since_step && self.allocated_node_parents[id] == ns
            })
            .map(|id| id as u32)
            .collect();
        let nodespaces = (0..self.nons)
            .filter(|&id| {
                id as u32 != nodespace_id
                    && self.nodespaces_last_changed[id] >= since_step
                    && self.allocated_nodespaces[id] == ns
            })
            .map(|id| id as u32)
            .collect();
        Ok((nodes, nodespaces))
    }

    // -- growth -------------------------------------------------------------

    /// Pre-grow vectors ahead of a bulk creation burst
    pub fn announce_nodes(&mut self, number_of_nodes: usize, average_elements_per_node: usize) {
        let free_nodes = self.non - self.live_node_count();
        let free_elements = self.noe - self.used_element_count();

        if number_of_nodes > free_nodes {
            let gap = number_of_nodes - free_nodes;
            let growby = gap + gap / 3;
            info!(
                "Per announcement in partition {}, growing id vectors by {} entries",
                self.pid, growby
            );
            self.grow_number_of_nodes(growby);
        }

        let number_of_elements = number_of_nodes * average_elements_per_node;
        if number_of_elements > free_elements {
            let gap = number_of_elements - free_elements;
            let growby = gap + gap / 3;
            info!(
                "Per announcement in partition {}, growing element vectors by {} entries",
                self.pid, growby
            );
            self.grow_number_of_elements(growby);
        }
    }

    /// Extend the node id capacity, preserving all existing entries
    pub fn grow_number_of_nodes(&mut self, growby: usize) {
        let new_non = self.non + growby;
        self.allocated_nodes.resize(new_non, 0);
        self.allocated_node_offsets.resize(new_non, 0);
        self.allocated_node_parents.resize(new_non, 0);
        self.nodes_last_changed.resize(new_non, -1);
        self.non = new_non;
        self.has_new_usages = true;
    }

    /// Extend the element capacity, preserving all existing entries
    pub fn grow_number_of_elements(&mut self, growby: usize) {
        let new_noe = self.noe + growby;
        self.allocated_elements_to_nodes.resize(new_noe, 0);
        self.allocated_elements_to_activators.resize(new_noe, 0);
        self.w.grow(new_noe);
        self.a.resize(new_noe, 0.0);
        self.a_in.resize(new_noe, 0.0);
        self.a_prev.resize(new_noe, 0.0);
        self.g_theta.resize(new_noe, 0.0);
        self.g_factor.resize(new_noe, 1.0);
        self.g_threshold.resize(new_noe, 0.0);
        self.g_amplification.resize(new_noe, 1.0);
        self.g_min.resize(new_noe, 0.0);
        self.g_max.resize(new_noe, 1.0);
        self.g_function_selector.resize(new_noe, 0);
        self.g_expect.resize(new_noe, 1.0);
        self.g_countdown.resize(new_noe, 0);
        self.g_wait.resize(new_noe, 1);
        self.n_function_selector.resize(new_noe, 0);
        self.n_node_porlinked = vec![0; new_noe];
        self.n_node_retlinked = vec![0; new_noe];
        self.noe = new_noe;
        self.has_new_usages = true;
        if self.has_pipes {
            self.por_ret_dirty = true;
        }
    }

    /// Extend the nodespace id capacity, preserving all existing entries
    pub fn grow_number_of_nodespaces(&mut self, growby: usize) {
        let new_nons = self.nons + growby;
        self.allocated_nodespaces.resize(new_nons, 0);
        for table in &mut self.nodespace_gate_activators {
            table.resize(new_nons, 0);
        }
        self.nodespace_sampling_activators.resize(new_nons, 0);
        self.nodespaces_last_changed.resize(new_nons, -1);
        self.nodespaces_contents_last_changed.resize(new_nons, -1);
        self.nons = new_nons;
        self.has_new_usages = true;
    }

    // -- node lifecycle -----------------------------------------------------

    fn find_free_node_id(&mut self) -> usize {
        for id in self.last_allocated_node + 1..self.non {
            if self.allocated_nodes[id] == 0 {
                return id;
            }
        }
        for id in 1..self.last_allocated_node {
            if self.allocated_nodes[id] == 0 {
                return id;
            }
        }
        let growby = self.non / 2;
        info!(
            "All {} node ids in partition {} in use, growing id vectors by {} entries",
            self.non, self.pid, growby
        );
        let id = self.non;
        self.grow_number_of_nodes(growby);
        id
    }

    fn find_free_element_run(&mut self, needed: usize) -> usize {
        if needed == 0 {
            return 0;
        }
        let mut i = self.last_allocated_offset + 1;
        let mut restarted = false;
        loop {
            if i == 0 {
                i = 1;
            }
            if i + needed > self.noe {
                if restarted {
                    break;
                }
                i = 1;
                restarted = true;
                continue;
            }
            match (0..needed).find(|&j| self.allocated_elements_to_nodes[i + j] != 0) {
                None => return i,
                Some(occupied_at) => {
                    i += occupied_at + 1;
                }
            }
        }
        let growby = (needed + 1).max(self.noe / 2);
        info!(
            "All {} elements in use in partition {}, growing element vectors by {} entries",
            self.noe, self.pid, growby
        );
        let offset = self.noe;
        self.grow_number_of_elements(growby);
        offset
    }

    /// Create a node; returns its id
    pub fn create_node(&mut self, node_type: i32, nodespace_id: u32, step: i32) -> Result<u32> {
        if !self.is_nodespace_live(nodespace_id) {
            return Err(EngineError::invalid_nodespace(nodespace_id));
        }
        let elements = self.elements_per_type(node_type)?;

        let id = self.find_free_node_id();
        let offset = self.find_free_element_run(elements);

        self.last_allocated_node = id;
        if elements > 0 {
            self.last_allocated_offset = offset;
        }
        self.allocated_nodes[id] = node_type;
        self.allocated_node_parents[id] = nodespace_id as i32;
        self.allocated_node_offsets[id] = offset as i32;
        for element in 0..elements {
            self.allocated_elements_to_nodes[offset + element] = id as i32;
        }
        self.mark_node_changed(id, step);

        match node_type {
            nodetype::PIPE => {
                self.has_pipes = true;
                self.has_new_usages = true;
                let selectors = [
                    nf::PIPE_GEN,
                    nf::PIPE_POR,
                    nf::PIPE_RET,
                    nf::PIPE_SUB,
                    nf::PIPE_SUR,
                    nf::PIPE_CAT,
                    nf::PIPE_EXP,
                ];
                for (k, &sel) in selectors.iter().enumerate() {
                    self.n_function_selector[offset + k] = sel;
                    self.g_threshold[offset + k] = -1.0;
                    self.g_min[offset + k] = -1.0;
                    self.g_max[offset + k] = 1.0;
                }
                for gate_index in gate::POR..=gate::EXP {
                    let activator =
                        self.nodespace_gate_activators[gate_index - 1][nodespace_id as usize];
                    self.allocated_elements_to_activators[offset + gate_index] =
                        self.allocated_node_offsets[activator as usize];
                }
                self.g_expect[offset + gate::GEN] = 1.0;
                self.g_expect[offset + gate::POR] = 1.0;
                self.g_expect[offset + gate::SUR] = 1.0;
                self.g_wait[offset + gate::POR] = DEFAULT_PIPE_WAIT;
                self.g_wait[offset + gate::SUR] = DEFAULT_PIPE_WAIT;
            }
            nodetype::LSTM => {
                self.has_lstms = true;
                self.has_new_usages = true;
                let selectors = [
                    nf::LSTM_GEN,
                    nf::LSTM_POR,
                    nf::LSTM_GIN,
                    nf::LSTM_GOU,
                    nf::LSTM_GFG,
                ];
                let sampler = self.nodespace_sampling_activators[nodespace_id as usize];
                for (k, &sel) in selectors.iter().enumerate() {
                    self.n_function_selector[offset + k] = sel;
                    self.g_threshold[offset + k] = -100.0;
                    self.g_min[offset + k] = -100.0;
                    self.g_max[offset + k] = 100.0;
                    self.allocated_elements_to_activators[offset + k] =
                        self.allocated_node_offsets[sampler as usize];
                }
            }
            _ => {}
        }

        for element in 0..elements {
            self.a[offset + element] = 0.0;
        }

        Ok(id as u32)
    }

    /// Delete a node, zeroing its elements and stripping every reference to it
    pub fn delete_node(&mut self, node_id: u32, step: i32) -> Result<()> {
        let node_type = self.node_type(node_id)?;
        let id = node_id as usize;
        let offset = self.allocated_node_offsets[id] as usize;
        let elements = self.elements_per_type(node_type)?;
        let parent = self.allocated_node_parents[id] as usize;

        self.unlink_node_completely(node_id, step)?;
        self.mark_node_changed(id, step);

        self.allocated_nodes[id] = 0;
        self.allocated_node_offsets[id] = 0;
        self.allocated_node_parents[id] = 0;
        for element in offset..offset + elements {
            self.allocated_elements_to_nodes[element] = 0;
            self.allocated_elements_to_activators[element] = 0;
            self.a[element] = 0.0;
            self.a_in[element] = 0.0;
            self.a_prev[element] = 0.0;
            self.g_theta[element] = 0.0;
            self.g_factor[element] = 1.0;
            self.g_threshold[element] = 0.0;
            self.g_amplification[element] = 1.0;
            self.g_min[element] = 0.0;
            self.g_max[element] = 1.0;
            self.g_function_selector[element] = 0;
            self.g_expect[element] = 1.0;
            self.g_countdown[element] = 0;
            self.g_wait[element] = 1;
            self.n_function_selector[element] = 0;
            self.n_node_porlinked[element] = 0;
            self.n_node_retlinked[element] = 0;
        }

        if node_type == nodetype::SENSOR {
            for entry in &mut self.sensor_indices {
                if *entry == id as i32 {
                    *entry = 0;
                }
            }
        }
        if node_type == nodetype::ACTUATOR {
            for entry in &mut self.actuator_indices {
                if *entry == id as i32 {
                    *entry = 0;
                }
            }
        }

        // hint at the freed id
        self.last_allocated_node = id.saturating_sub(1);

        self.native_instances.remove(&node_id);
        self.native_slot_snapshots.remove(&node_id);
        self.comments.remove(&node_id);

        // clear activator usage
        if node_type == nodetype::ACTIVATOR && offset > 0 {
            for entry in &mut self.allocated_elements_to_activators {
                if *entry == offset as i32 {
                    *entry = 0;
                }
            }
        }
        if parent < self.nons {
            for table in &mut self.nodespace_gate_activators {
                if table[parent] == id as i32 {
                    table[parent] = 0;
                }
            }
            if self.nodespace_sampling_activators[parent] == id as i32 {
                self.nodespace_sampling_activators[parent] = 0;
            }
        }

        self.por_ret_dirty = self.has_pipes;
        Ok(())
    }

    fn unlink_node_completely(&mut self, node_id: u32, step: i32) -> Result<()> {
        let node_type = self.node_type(node_id)?;
        let id = node_id as usize;
        let offset = self.allocated_node_offsets[id] as usize;
        let elements = self.elements_per_type(node_type)?;
        let range = offset..offset + elements;

        let outgoing = self.w.entries_in_cols(range.clone());
        let incoming = self.w.entries_in_rows(range.clone());
        self.w.zero_rows_and_cols(range);

        self.mark_node_changed(id, step);
        for (row, _) in outgoing {
            let other = self.allocated_elements_to_nodes[row] as usize;
            self.mark_node_changed(other, step);
        }
        for (_, col) in incoming {
            let other = self.allocated_elements_to_nodes[col] as usize;
            self.mark_node_changed(other, step);
        }
        Ok(())
    }

    /// Node ids connected to this node through the weight matrix, either direction
    pub fn get_associated_node_ids(&self, node_id: u32) -> Result<Vec<u32>> {
        let node_type = self.node_type(node_id)?;
        let offset = self.allocated_node_offsets[node_id as usize] as usize;
        let elements = self.elements_per_type(node_type)?;
        let range = offset..offset + elements;

        let mut ids: Vec<u32> = self
            .w
            .entries_in_cols(range.clone())
            .into_iter()
            .map(|(row, _)| self.allocated_elements_to_nodes[row] as u32)
            .chain(
                self.w
                    .entries_in_rows(range)
                    .into_iter()
                    .map(|(_, col)| self.allocated_elements_to_nodes[col] as u32),
            )
            .filter(|&id| id != 0 && id != node_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    // -- nodespace lifecycle ------------------------------------------------

    /// Create a nodespace under a live parent; returns its id
    pub fn create_nodespace(&mut self, parent_id: u32, step: i32) -> Result<u32> {
        if !self.is_nodespace_live(parent_id) {
            return Err(EngineError::invalid_nodespace(parent_id));
        }
        let mut id = 0usize;
        for candidate in self.last_allocated_nodespace + 1..self.nons {
            if self.allocated_nodespaces[candidate] == 0 {
                id = candidate;
                break;
            }
        }
        if id < 1 {
            for candidate in 1..self.last_allocated_nodespace {
                if self.allocated_nodespaces[candidate] == 0 {
                    id = candidate;
                    break;
                }
            }
        }
        if id < 1 {
            let growby = (self.nons / 2).max(1);
            info!(
                "All {} nodespace ids in use in partition {}, growing nodespace vectors by {} entries",
                self.nons, self.pid, growby
            );
            id = self.nons;
            self.grow_number_of_nodespaces(growby);
        }

        self.last_allocated_nodespace = id;
        self.allocated_nodespaces[id] = parent_id as i32;
        self.nodespaces_last_changed[id] = step;
        self.nodespaces_contents_last_changed[parent_id as usize] = step;
        Ok(id as u32)
    }

    /// Delete a nodespace, recursively removing child nodespaces and member nodes
    pub fn delete_nodespace(&mut self, nodespace_id: u32, step: i32) -> Result<()> {
        if nodespace_id == ROOT_NODESPACE {
            return Err(EngineError::invalid_nodespace(nodespace_id));
        }
        if !self.is_nodespace_live(nodespace_id) {
            return Err(EngineError::invalid_nodespace(nodespace_id));
        }

        let children: Vec<u32> = (0..self.nons)
            .filter(|&id| {
                id as u32 != nodespace_id && self.allocated_nodespaces[id] == nodespace_id as i32
            })
            .map(|id| id as u32)
            .collect();
        for child in children {
            self.delete_nodespace(child, step)?;
        }

        let members: Vec<u32> = (0..self.non)
            .filter(|&id| {
                self.allocated_nodes[id] != 0
                    && self.allocated_node_parents[id] == nodespace_id as i32
            })
            .map(|id| id as u32)
            .collect();
        for node in members {
            self.delete_node(node, step)?;
        }

        let parent = self.allocated_nodespaces[nodespace_id as usize] as usize;
        self.allocated_nodespaces[nodespace_id as usize] = 0;
        for table in &mut self.nodespace_gate_activators {
            table[nodespace_id as usize] = 0;
        }
        self.nodespace_sampling_activators[nodespace_id as usize] = 0;
        self.nodegroups.remove(&nodespace_id);
        self.last_allocated_nodespace = nodespace_id as usize;
        if parent < self.nons {
            self.nodespaces_contents_last_changed[parent] = step;
        }
        Ok(())
    }

    // -- link editing -------------------------------------------------------

    /// Set the weight of the link from a gate to a slot; 0 deletes the link
    pub fn set_link_weight(
        &mut self,
        source_node: u32,
        gate_index: usize,
        target_node: u32,
        slot_index: usize,
        weight: f32,
        step: i32,
    ) -> Result<()> {
        let source_type = self.node_type(source_node)?;
        let target_type = self.node_type(target_node)?;
        if gate_index >= self.gates_per_type(source_type)? {
            return Err(EngineError::InvalidGateOrSlot {
                node: source_node,
                channel: "gate",
                index: gate_index,
            });
        }
        if slot_index >= self.slots_per_type(target_type)? {
            return Err(EngineError::InvalidGateOrSlot {
                node: target_node,
                channel: "slot",
                index: slot_index,
            });
        }

        let row = self.allocated_node_offsets[target_node as usize] as usize + slot_index;
        let col = self.allocated_node_offsets[source_node as usize] as usize + gate_index;
        self.w.set(row, col, weight)?;

        self.mark_node_changed(source_node as usize, step);
        self.mark_node_changed(target_node as usize, step);

        if target_type == nodetype::PIPE && slot_index == gate::POR {
            let linked = self.w.row_any_nonzero(row) as i8;
            let offset = self.allocated_node_offsets[target_node as usize] as usize;
            for element in offset..offset + 7 {
                self.n_node_porlinked[element] = linked;
            }
        }
        if target_type == nodetype::PIPE && slot_index == gate::RET {
            let linked = self.w.row_any_nonzero(row) as i8;
            let offset = self.allocated_node_offsets[target_node as usize] as usize;
            for element in offset..offset + 7 {
                self.n_node_retlinked[element] = linked;
            }
        }
        Ok(())
    }

    /// Weight of the link from a gate to a slot
    pub fn get_link_weight(
        &self,
        source_node: u32,
        gate_index: usize,
        target_node: u32,
        slot_index: usize,
    ) -> Result<f32> {
        let source_type = self.node_type(source_node)?;
        let target_type = self.node_type(target_node)?;
        if gate_index >= self.gates_per_type(source_type)? {
            return Err(EngineError::InvalidGateOrSlot {
                node: source_node,
                channel: "gate",
                index: gate_index,
            });
        }
        if slot_index >= self.slots_per_type(target_type)? {
            return Err(EngineError::InvalidGateOrSlot {
                node: target_node,
                channel: "slot",
                index: slot_index,
            });
        }
        let row = self.allocated_node_offsets[target_node as usize] as usize + slot_index;
        let col = self.allocated_node_offsets[source_node as usize] as usize + gate_index;
        self.w.get(row, col)
    }

    // -- parameters ---------------------------------------------------------

    /// Set one gate parameter of a node
    pub fn set_node_gate_parameter(
        &mut self,
        node_id: u32,
        gate_index: usize,
        parameter: GateParameter,
        value: f32,
        step: i32,
    ) -> Result<()> {
        let element = self.element_index(node_id, gate_index)?;
        match parameter {
            GateParameter::Threshold => self.g_threshold[element] = value,
            GateParameter::Amplification => self.g_amplification[element] = value,
            GateParameter::Minimum => self.g_min[element] = value,
            GateParameter::Maximum => self.g_max[element] = value,
            GateParameter::Theta => self.g_theta[element] = value,
        }
        self.mark_node_changed(node_id as usize, step);
        Ok(())
    }

    /// Select the transfer function of one gate
    pub fn set_node_gatefunction(
        &mut self,
        node_id: u32,
        gate_index: usize,
        function: GateFunction,
        step: i32,
    ) -> Result<()> {
        let element = self.element_index(node_id, gate_index)?;
        self.g_function_selector[element] = function.selector();
        match function {
            GateFunction::Absolute => self.has_gatefunction_absolute = true,
            GateFunction::Sigmoid => self.has_gatefunction_sigmoid = true,
            GateFunction::Tanh => self.has_gatefunction_tanh = true,
            GateFunction::Rect => self.has_gatefunction_rect = true,
            GateFunction::Dist => self.has_gatefunction_one_over_x = true,
            GateFunction::Identity => {}
        }
        self.has_new_usages = true;
        self.mark_node_changed(node_id as usize, step);
        Ok(())
    }

    /// Set a node-level parameter (Pipe nodes only)
    pub fn set_node_parameter(
        &mut self,
        node_id: u32,
        parameter: NodeParameter,
        value: f32,
        step: i32,
    ) -> Result<()> {
        if self.node_type(node_id)? != nodetype::PIPE {
            return Err(EngineError::InvalidType {
                type_id: self.allocated_nodes[node_id as usize],
            });
        }
        let offset = self.allocated_node_offsets[node_id as usize] as usize;
        match parameter {
            NodeParameter::Expectation => {
                self.g_expect[offset + gate::GEN] = value;
                self.g_expect[offset + gate::POR] = value;
                self.g_expect[offset + gate::SUR] = value;
            }
            NodeParameter::Wait => {
                let wait = (value as i16).min(128);
                self.g_wait[offset + gate::POR] = wait;
                self.g_wait[offset + gate::SUR] = wait;
            }
        }
        self.mark_node_changed(node_id as usize, step);
        Ok(())
    }

    /// Write one gate activation directly
    pub fn set_activation(
        &mut self,
        node_id: u32,
        gate_index: usize,
        value: f32,
        step: i32,
    ) -> Result<()> {
        let element = self.element_index(node_id, gate_index)?;
        self.a[element] = value;
        self.mark_node_changed(node_id as usize, step);
        Ok(())
    }

    /// Read one gate activation
    pub fn get_activation(&self, node_id: u32, gate_index: usize) -> Result<f32> {
        let element = self.element_index(node_id, gate_index)?;
        Ok(self.a[element])
    }

    /// Add external input to one slot, consumed by the next propagation
    pub fn add_external_input(&mut self, node_id: u32, slot_index: usize, value: f32) -> Result<()> {
        let element = self.element_index(node_id, slot_index)?;
        self.a_in[element] += value;
        Ok(())
    }

    // -- activators ---------------------------------------------------------

    /// Assign (or clear, with id 0) the directional activator of a nodespace
    pub fn set_nodespace_gatetype_activator(
        &mut self,
        nodespace_id: u32,
        gate_index: usize,
        activator_id: u32,
    ) -> Result<()> {
        if !self.is_nodespace_live(nodespace_id) {
            return Err(EngineError::invalid_nodespace(nodespace_id));
        }
        if !(gate::POR..=gate::EXP).contains(&gate_index) {
            return Err(EngineError::InvalidGateOrSlot {
                node: activator_id,
                channel: "gate",
                index: gate_index,
            });
        }
        if activator_id != 0 && self.node_type(activator_id)? != nodetype::ACTIVATOR {
            return Err(EngineError::InvalidType {
                type_id: self.allocated_nodes[activator_id as usize],
            });
        }

        self.nodespace_gate_activators[gate_index - 1][nodespace_id as usize] = activator_id as i32;
        if activator_id != 0 {
            self.has_directional_activators = true;
            self.has_new_usages = true;
        }

        let activator_offset = self.allocated_node_offsets[activator_id as usize];
        for node in 0..self.non {
            if self.allocated_nodes[node] == nodetype::PIPE
                && self.allocated_node_parents[node] == nodespace_id as i32
            {
                let offset = self.allocated_node_offsets[node] as usize;
                self.allocated_elements_to_activators[offset + gate_index] = activator_offset;
            }
        }
        Ok(())
    }

    /// Assign (or clear, with id 0) the sampling activator of a nodespace
    pub fn set_nodespace_sampling_activator(
        &mut self,
        nodespace_id: u32,
        activator_id: u32,
    ) -> Result<()> {
        if !self.is_nodespace_live(nodespace_id) {
            return Err(EngineError::invalid_nodespace(nodespace_id));
        }
        if activator_id != 0 && self.node_type(activator_id)? != nodetype::ACTIVATOR {
            return Err(EngineError::InvalidType {
                type_id: self.allocated_nodes[activator_id as usize],
            });
        }

        self.nodespace_sampling_activators[nodespace_id as usize] = activator_id as i32;
        if activator_id != 0 {
            self.has_sampling_activators = true;
            self.has_new_usages = true;
        }

        let activator_offset = self.allocated_node_offsets[activator_id as usize];
        for node in 0..self.non {
            if self.allocated_nodes[node] == nodetype::LSTM
                && self.allocated_node_parents[node] == nodespace_id as i32
            {
                let offset = self.allocated_node_offsets[node] as usize;
                for k in 0..5 {
                    self.allocated_elements_to_activators[offset + k] = activator_offset;
                }
            }
        }
        Ok(())
    }

    // -- sensors and actuators ----------------------------------------------

    /// Bind a sensor node to a datasource slot
    pub fn bind_sensor(&mut self, slot: usize, node_id: u32) -> Result<()> {
        if self.node_type(node_id)? != nodetype::SENSOR {
            return Err(EngineError::InvalidType {
                type_id: self.allocated_nodes[node_id as usize],
            });
        }
        if self.sensor_indices.len() <= slot {
            self.sensor_indices.resize(slot + 1, 0);
        }
        self.sensor_indices[slot] = node_id as i32;
        Ok(())
    }

    /// Bind an actuator node to a datatarget slot
    pub fn bind_actuator(&mut self, slot: usize, node_id: u32) -> Result<()> {
        if self.node_type(node_id)? != nodetype::ACTUATOR {
            return Err(EngineError::InvalidType {
                type_id: self.allocated_nodes[node_id as usize],
            });
        }
        if self.actuator_indices.len() <= slot {
            self.actuator_indices.resize(slot + 1, 0);
        }
        self.actuator_indices[slot] = node_id as i32;
        Ok(())
    }

    /// Length of the datasource slot table
    pub fn sensor_slot_count(&self) -> usize {
        self.sensor_indices.len()
    }

    /// Length of the datatarget slot table
    pub fn actuator_slot_count(&self) -> usize {
        self.actuator_indices.len()
    }

    /// Feed datasource values into the bound sensors' input vector
    pub fn apply_sensor_inputs(&mut self, values: &[f32]) {
        for (slot, &node) in self.sensor_indices.iter().enumerate() {
            if node > 0 && slot < values.len() {
                let element = self.allocated_node_offsets[node as usize] as usize;
                self.a_in[element] += values[slot];
            }
        }
    }

    /// Read the bound actuators' activations into datatarget values
    pub fn collect_actuator_outputs(&self, values: &mut [f32]) {
        for (slot, &node) in self.actuator_indices.iter().enumerate() {
            if node > 0 && slot < values.len() {
                let element = self.allocated_node_offsets[node as usize] as usize;
                values[slot] = self.a[element];
            }
        }
    }

    // -- groups -------------------------------------------------------------

    /// Define a named group over the given nodes' chosen gate
    pub fn group_nodes_by_ids(
        &mut self,
        nodespace_id: u32,
        ids: &[u32],
        group_name: impl Into<String>,
        gate_index: usize,
    ) -> Result<()> {
        if !self.is_nodespace_live(nodespace_id) {
            return Err(EngineError::invalid_nodespace(nodespace_id));
        }
        let mut elements = Vec::with_capacity(ids.len());
        for &id in ids {
            if self.node_parent(id)? != nodespace_id {
                return Err(EngineError::invalid_node(id));
            }
            elements.push(self.element_index(id, gate_index)?);
        }
        self.nodegroups
            .entry(nodespace_id)
            .or_default()
            .insert(group_name.into(), elements);
        Ok(())
    }

    /// Drop a named group
    pub fn ungroup_nodes(&mut self, nodespace_id: u32, group_name: &str) {
        if let Some(groups) = self.nodegroups.get_mut(&nodespace_id) {
            groups.remove(group_name);
        }
    }

    fn group(&self, nodespace_id: u32, group_name: &str) -> Result<&Vec<usize>> {
        self.nodegroups
            .get(&nodespace_id)
            .and_then(|groups| groups.get(group_name))
            .ok_or_else(|| EngineError::InvalidGroup {
                group: group_name.to_string(),
                nodespace: nodespace_id,
            })
    }

    /// Activations of a group, in group order
    pub fn get_activations(&self, nodespace_id: u32, group_name: &str) -> Result<Vec<f32>> {
        let group = self.group(nodespace_id, group_name)?;
        Ok(group.iter().map(|&e| self.a[e]).collect())
    }

    /// Overwrite the activations of a group
    pub fn set_activations(
        &mut self,
        nodespace_id: u32,
        group_name: &str,
        values: &[f32],
        step: i32,
    ) -> Result<()> {
        let group = self.group(nodespace_id, group_name)?.clone();
        if group.len() != values.len() {
            return Err(EngineError::shape_mismatch(
                format!("{} values", group.len()),
                format!("{} values", values.len()),
            ));
        }
        for (&element, &value) in group.iter().zip(values) {
            self.a[element] = value;
            let node = self.allocated_elements_to_nodes[element] as usize;
            self.mark_node_changed(node, step);
        }
        Ok(())
    }

    /// Thetas of a group, in group order
    pub fn get_thetas(&self, nodespace_id: u32, group_name: &str) -> Result<Vec<f32>> {
        let group = self.group(nodespace_id, group_name)?;
        Ok(group.iter().map(|&e| self.g_theta[e]).collect())
    }

    /// Overwrite the thetas of a group
    pub fn set_thetas(
        &mut self,
        nodespace_id: u32,
        group_name: &str,
        values: &[f32],
        step: i32,
    ) -> Result<()> {
        let group = self.group(nodespace_id, group_name)?.clone();
        if group.len() != values.len() {
            return Err(EngineError::shape_mismatch(
                format!("{} values", group.len()),
                format!("{} values", values.len()),
            ));
        }
        for (&element, &value) in group.iter().zip(values) {
            self.g_theta[element] = value;
            let node = self.allocated_elements_to_nodes[element] as usize;
            self.mark_node_changed(node, step);
        }
        Ok(())
    }

    /// Read the `(|to|, |from|)` weight block between two groups, row-major
    pub fn get_link_weights(
        &self,
        nodespace_from: u32,
        group_from: &str,
        nodespace_to: u32,
        group_to: &str,
    ) -> Result<Vec<f32>> {
        let from = self.group(nodespace_from, group_from)?;
        let to = self.group(nodespace_to, group_to)?;
        self.w.submatrix(to, from)
    }

    /// Overwrite the `(|to|, |from|)` weight block between two groups
    pub fn set_link_weights(
        &mut self,
        nodespace_from: u32,
        group_from: &str,
        nodespace_to: u32,
        group_to: &str,
        block: &[f32],
        step: i32,
    ) -> Result<()> {
        let from = self.group(nodespace_from, group_from)?.clone();
        let to = self.group(nodespace_to, group_to)?.clone();
        self.w.set_submatrix(&to, &from, block)?;

        for &element in from.iter().chain(to.iter()) {
            let node = self.allocated_elements_to_nodes[element] as usize;
            self.mark_node_changed(node, step);
        }
        self.por_ret_dirty = self.has_pipes;
        Ok(())
    }

    // -- inter-partition links ----------------------------------------------

    /// Incoming link blocks, keyed by source partition
    pub fn inlinks(&self) -> &BTreeMap<u32, InlinkBlock> {
        &self.inlinks
    }

    /// Merge element sets and weights into the block for a source partition
    pub fn set_inlink_weights(
        &mut self,
        from_partition: u32,
        from_elements: &[u32],
        to_elements: &[u32],
        weights: &[f32],
        step: i32,
    ) -> Result<()> {
        for &to in to_elements {
            if to as usize >= self.noe {
                return Err(EngineError::shape_mismatch(
                    format!("to-elements below {}", self.noe),
                    format!("{}", to),
                ));
            }
        }
        // single tracked pairs update in place; everything else merges
        let updated_in_place = from_elements.len() == 1
            && to_elements.len() == 1
            && weights.len() == 1
            && self
                .inlinks
                .get_mut(&from_partition)
                .map(|block| block.set_weight(from_elements[0], to_elements[0], weights[0]))
                .unwrap_or(false);
        if !updated_in_place {
            self.inlinks
                .entry(from_partition)
                .or_default()
                .merge(from_elements, to_elements, weights)?;
        }
        for &to in to_elements {
            let node = self.allocated_elements_to_nodes[to as usize] as usize;
            self.mark_node_changed(node, step);
        }
        Ok(())
    }

    /// Add a cross-partition contribution, one value per block to-element
    pub fn apply_inlink_contribution(&mut self, from_partition: u32, values: &[f32]) {
        if let Some(block) = self.inlinks.get(&from_partition) {
            for (i, &to) in block.to_elements().iter().enumerate() {
                self.a_in[to as usize] += values[i];
            }
        }
    }

    // -- the two-phase step -------------------------------------------------

    /// Linear propagation: `a_prev ← a; a ← a_in + W·a; a_in ← 0`
    pub fn propagate(&mut self) {
        self.a_prev.copy_from_slice(&self.a);
        let mut next = self.a_in.clone();
        self.w.propagate_into(&self.a, &mut next);
        std::mem::swap(&mut self.a, &mut next);
        self.a_in.fill(0.0);
    }

    /// Non-linear per-element update: node functions, then the gate pipeline
    pub fn calculate(&mut self, step: i32) {
        self.has_new_usages = false;

        if self.por_ret_dirty {
            self.rebuild_por_linked();
            self.rebuild_ret_linked();
            self.por_ret_dirty = false;
        }

        self.take_native_slot_snapshots();

        let needs_shifted = self.has_pipes || self.has_lstms;
        let mut slots = ShiftedView::empty();
        let mut thetas = ShiftedView::empty();
        if needs_shifted {
            slots.rebuild(&self.a);
            thetas.rebuild(&self.g_theta);
        }

        if self.has_directional_activators || self.has_sampling_activators {
            self.compute_gate_factors();
        }

        let noe = self.noe;
        let mut x = vec![0.0f32; noe];
        let mut countdown = self.g_countdown.clone();
        if needs_shifted {
            let inputs = DispatchInputs {
                a: &self.a,
                a_prev: &self.a_prev,
                slots: &slots,
                thetas: &thetas,
                g_factor: &self.g_factor,
                g_expect: &self.g_expect,
                g_wait: &self.g_wait,
                g_countdown: &self.g_countdown,
                n_function_selector: &self.n_function_selector,
                por_linked: &self.n_node_porlinked,
                ret_linked: &self.n_node_retlinked,
                step,
                has_directional_activators: self.has_directional_activators,
                has_sampling_activators: self.has_sampling_activators,
            };
            for (e, slot) in x.iter_mut().enumerate() {
                let update = dispatch_element(&inputs, e);
                *slot = update.x;
                countdown[e] = update.countdown;
            }
        } else {
            x.copy_from_slice(&self.a);
        }

        for e in 0..noe {
            let params = GateParams {
                selector: self.g_function_selector[e],
                theta: self.g_theta[e],
                threshold: self.g_threshold[e],
                amplification: self.g_amplification[e],
                min: self.g_min[e],
                max: self.g_max[e],
            };
            self.a[e] = apply_gate(x[e], &params);
        }
        self.g_countdown = countdown;
    }

    fn compute_gate_factors(&mut self) {
        self.a[0] = 1.0;
        for e in 0..self.noe {
            self.g_factor[e] = self.a[self.allocated_elements_to_activators[e] as usize];
        }
    }

    fn take_native_slot_snapshots(&mut self) {
        let ids: Vec<u32> = self.native_instances.keys().copied().collect();
        self.native_slot_snapshots.clear();
        for id in ids {
            let offset = self.allocated_node_offsets[id as usize] as usize;
            let node_type = self.allocated_nodes[id as usize];
            if let Ok(count) = self.elements_per_type(node_type) {
                self.native_slot_snapshots
                    .insert(id, self.a[offset..offset + count].to_vec());
            }
        }
    }

    /// Run every native module instance against the post-dispatch activations
    pub fn run_native_modules(&mut self, step: i32) {
        let mut instances = std::mem::take(&mut self.native_instances);
        for (&node_id, module) in instances.iter_mut() {
            let offset = self.allocated_node_offsets[node_id as usize] as usize;
            let node_type = self.allocated_nodes[node_id as usize];
            let count = match self.elements_per_type(node_type) {
                Ok(count) => count,
                Err(_) => continue,
            };
            let empty = Vec::new();
            let slots = self.native_slot_snapshots.get(&node_id).unwrap_or(&empty);
            let mut ctx = NativeModuleContext {
                step,
                slots,
                gates: &mut self.a[offset..offset + count],
            };
            module.node_function(&mut ctx);
        }
        self.native_instances = instances;
    }

    /// Recompute por-linked flags from the weight matrix
    pub fn rebuild_por_linked(&mut self) {
        self.n_node_porlinked.fill(0);
        for element in 1..self.noe {
            if self.n_function_selector[element] == nf::PIPE_POR && element + 6 <= self.noe {
                let linked = self.w.row_any_nonzero(element) as i8;
                // por sits at offset + 1; flag all seven elements of the node
                for k in 0..7 {
                    self.n_node_porlinked[element - 1 + k] = linked;
                }
            }
        }
    }

    /// Recompute ret-linked flags from the weight matrix
    pub fn rebuild_ret_linked(&mut self) {
        self.n_node_retlinked.fill(0);
        for element in 2..self.noe {
            if self.n_function_selector[element] == nf::PIPE_RET && element + 5 <= self.noe {
                let linked = self.w.row_any_nonzero(element) as i8;
                // ret sits at offset + 2; flag all seven elements of the node
                for k in 0..7 {
                    self.n_node_retlinked[element - 2 + k] = linked;
                }
            }
        }
    }

    // -- snapshots ----------------------------------------------------------

    /// Read node state, optionally filtered by nodespaces or explicit ids
    pub fn get_node_data(
        &self,
        nodespace_ids: Option<&[u32]>,
        ids: Option<&[u32]>,
        include_links: bool,
        include_followupnodes: bool,
    ) -> Result<NodeDataResult> {
        let selected: Vec<u32> = match ids {
            Some(ids) => {
                for &id in ids {
                    if !self.is_node_live(id) {
                        return Err(EngineError::invalid_node(id));
                    }
                }
                ids.to_vec()
            }
            None => {
                if let Some(nodespaces) = nodespace_ids {
                    for &ns in nodespaces {
                        if !self.is_nodespace_live(ns) {
                            return Err(EngineError::invalid_nodespace(ns));
                        }
                    }
                }
                (0..self.non)
                    .filter(|&id| self.allocated_nodes[id] != 0)
                    .map(|id| id as u32)
                    .filter(|&id| {
                        nodespace_ids.map_or(true, |nodespaces| {
                            nodespaces
                                .contains(&(self.allocated_node_parents[id as usize] as u32))
                        })
                    })
                    .collect()
            }
        };

        let mut result = NodeDataResult::default();
        let mut followups: Vec<u32> = Vec::new();
        for &id in &selected {
            let node_type = self.allocated_nodes[id as usize];
            let offset = self.allocated_node_offsets[id as usize] as usize;
            let elements = self.elements_per_type(node_type)?;

            let links = if include_links {
                self.w
                    .entries_in_cols(offset..offset + elements)
                    .into_iter()
                    .map(|(row, col)| {
                        let target = self.allocated_elements_to_nodes[row] as u32;
                        let target_offset = self.allocated_node_offsets[target as usize] as usize;
                        LinkData {
                            source_node: id,
                            source_gate: col - offset,
                            target_node: target,
                            target_slot: row - target_offset,
                            weight: self.w.get(row, col).unwrap_or(0.0),
                        }
                    })
                    .collect()
            } else {
                Vec::new()
            };

            if include_followupnodes {
                followups.extend(self.get_associated_node_ids(id)?);
            }

            result.nodes.push(NodeData {
                id,
                node_type,
                parent_nodespace: self.allocated_node_parents[id as usize] as u32,
                activations: self.a[offset..offset + elements].to_vec(),
                links,
            });
        }

        followups.sort_unstable();
        followups.dedup();
        followups.retain(|id| !selected.contains(id));
        result.followup_ids = followups;
        Ok(result)
    }

    /// Check the allocation invariants; returns human-readable violations
    pub fn integrity_check(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut expected_map = vec![0i32; self.noe];
        for id in 0..self.non {
            let node_type = self.allocated_nodes[id];
            if node_type == 0 {
                continue;
            }
            let offset = self.allocated_node_offsets[id] as usize;
            let elements = match self.elements_per_type(node_type) {
                Ok(count) => count,
                Err(_) => {
                    problems.push(format!("node {} has unknown type {}", id, node_type));
                    continue;
                }
            };
            if offset + elements > self.noe {
                problems.push(format!("node {} runs past the element vectors", id));
                continue;
            }
            for element in offset..offset + elements {
                if expected_map[element] != 0 {
                    problems.push(format!(
                        "element {} claimed by nodes {} and {}",
                        element, expected_map[element], id
                    ));
                }
                expected_map[element] = id as i32;
            }
        }
        if expected_map != self.allocated_elements_to_nodes {
            for element in 0..self.noe {
                if expected_map[element] != self.allocated_elements_to_nodes[element] {
                    problems.push(format!(
                        "element {} maps to node {} but should map to {}",
                        element, self.allocated_elements_to_nodes[element], expected_map[element]
                    ));
                }
            }
        }
        for element in 0..self.noe {
            let countdown = self.g_countdown[element];
            if countdown < -1 || countdown > self.g_wait[element].max(0) {
                problems.push(format!(
                    "element {} countdown {} outside [-1, {}]",
                    element, countdown, self.g_wait[element]
                ));
            }
        }
        problems
    }

    // -- persistence ---------------------------------------------------------

    /// Serialize the complete numerical state into an archive
    pub fn save(&self) -> ArrayArchive {
        let mut archive = ArrayArchive::new();
        archive.insert_i32("sizeinformation", vec![
            self.non as i32,
            self.noe as i32,
            self.nons as i32,
        ]);
        archive.insert_i8("sparse", vec![self.sparse as i8]);
        archive.insert_i32("allocated_nodes", self.allocated_nodes.clone());
        archive.insert_i32("allocated_node_offsets", self.allocated_node_offsets.clone());
        archive.insert_i32(
            "allocated_elements_to_nodes",
            self.allocated_elements_to_nodes.clone(),
        );
        archive.insert_i32("allocated_node_parents", self.allocated_node_parents.clone());
        archive.insert_i32("allocated_nodespaces", self.allocated_nodespaces.clone());
        archive.insert_i32(
            "allocated_elements_to_activators",
            self.allocated_elements_to_activators.clone(),
        );
        for (gate_index, name) in crate::types::DIRECTIONAL_GATES.iter().enumerate() {
            archive.insert_i32(
                format!("allocated_nodespaces_{}_activators", name),
                self.nodespace_gate_activators[gate_index].clone(),
            );
        }
        archive.insert_i32(
            "allocated_nodespaces_sampling_activators",
            self.nodespace_sampling_activators.clone(),
        );

        let (w_data, w_indices, w_indptr) = self.w.to_csr_parts();
        archive.insert_f32("w_data", w_data);
        archive.insert_i32("w_indices", w_indices);
        archive.insert_i32("w_indptr", w_indptr);

        archive.insert_f32("a", self.a.clone());
        archive.insert_f32("g_theta", self.g_theta.clone());
        archive.insert_f32("g_factor", self.g_factor.clone());
        archive.insert_f32("g_threshold", self.g_threshold.clone());
        archive.insert_f32("g_amplification", self.g_amplification.clone());
        archive.insert_f32("g_min", self.g_min.clone());
        archive.insert_f32("g_max", self.g_max.clone());
        archive.insert_i8("g_function_selector", self.g_function_selector.clone());
        archive.insert_f32("g_expect", self.g_expect.clone());
        archive.insert_i16("g_countdown", self.g_countdown.clone());
        archive.insert_i16("g_wait", self.g_wait.clone());
        archive.insert_i8("n_function_selector", self.n_function_selector.clone());

        archive.insert_i32("sensor_indices", self.sensor_indices.clone());
        archive.insert_i32("actuator_indices", self.actuator_indices.clone());

        if !self.inlinks.is_empty() {
            let mut pids = Vec::new();
            let mut from_lengths = Vec::new();
            let mut to_lengths = Vec::new();
            let mut from_elements = Vec::new();
            let mut to_elements = Vec::new();
            let mut weights = Vec::new();
            for (&pid, block) in &self.inlinks {
                pids.push(pid as i16);
                from_lengths.push(block.from_elements().len() as i32);
                to_lengths.push(block.to_elements().len() as i32);
                from_elements.extend(block.from_elements().iter().map(|&e| e as i32));
                to_elements.extend(block.to_elements().iter().map(|&e| e as i32));
                weights.extend_from_slice(block.weights());
            }
            archive.insert_i16("inlink_pids", pids);
            archive.insert_i32("inlink_from_lengths", from_lengths);
            archive.insert_i32("inlink_to_lengths", to_lengths);
            archive.insert_i32("inlink_from_elements", from_elements);
            archive.insert_i32("inlink_to_elements", to_elements);
            archive.insert_f32("inlink_weights", weights);
        }

        archive
    }

    /// Rebuild a partition from an archive, defaulting missing arrays
    pub fn load(pid: u32, archive: &ArrayArchive) -> Result<Self> {
        let (non, noe, nons) = match archive.get_i32("sizeinformation")? {
            Some(size) if size.len() == 3 && size.iter().all(|&s| s >= 0) => (
                (size[0] as usize).max(2),
                (size[1] as usize).max(16),
                (size[2] as usize).max(2),
            ),
            _ => {
                warn!("no sizeinformation in file, falling back to defaults");
                let config = PartitionConfig::default();
                (
                    config.initial_number_of_nodes,
                    config.initial_number_of_nodes * config.average_elements_per_node,
                    config.initial_number_of_nodespaces,
                )
            }
        };
        let sparse = match archive.get_i8("sparse")? {
            Some(flag) => flag.first().copied().unwrap_or(1) != 0,
            None => true,
        };

        let config = PartitionConfig {
            sparse,
            initial_number_of_nodes: non,
            average_elements_per_node: 1,
            initial_number_of_nodespaces: nons,
        };
        let mut partition = Self::new(pid, &config);
        partition.non = non;
        partition.noe = noe;
        partition.nons = nons;

        partition.allocated_nodes = load_i32(archive, "allocated_nodes", non, 0)?;
        partition.allocated_node_offsets = load_i32(archive, "allocated_node_offsets", non, 0)?;
        partition.allocated_elements_to_nodes =
            load_i32(archive, "allocated_elements_to_nodes", noe, 0)?;
        partition.allocated_node_parents = load_i32(archive, "allocated_node_parents", non, 0)?;
        partition.allocated_nodespaces = load_i32(archive, "allocated_nodespaces", nons, 0)?;
        partition.allocated_nodespaces[ROOT_NODESPACE as usize] = ROOT_NODESPACE as i32;
        partition.allocated_elements_to_activators =
            load_i32(archive, "allocated_elements_to_activators", noe, 0)?;
        for (gate_index, name) in crate::types::DIRECTIONAL_GATES.iter().enumerate() {
            partition.nodespace_gate_activators[gate_index] = load_i32(
                archive,
                &format!("allocated_nodespaces_{}_activators", name),
                nons,
                0,
            )?;
        }
        partition.nodespace_sampling_activators =
            load_i32(archive, "allocated_nodespaces_sampling_activators", nons, 0)?;

        partition.nodes_last_changed = vec![-1; non];
        partition.nodespaces_last_changed = vec![-1; nons];
        partition.nodespaces_contents_last_changed = vec![-1; nons];

        match (
            archive.get_f32("w_data")?,
            archive.get_i32("w_indices")?,
            archive.get_i32("w_indptr")?,
        ) {
            (Some(data), Some(indices), Some(indptr)) => {
                partition.w = WeightMatrix::from_csr_parts(noe, data, indices, indptr, sparse)?;
            }
            _ => {
                warn!("no w_data, w_indices or w_indptr in file, falling back to defaults");
                partition.w = WeightMatrix::new(noe, sparse);
            }
        }

        partition.a = load_f32(archive, "a", noe, 0.0)?;
        partition.a_in = vec![0.0; noe];
        partition.a_prev = vec![0.0; noe];
        partition.g_theta = load_f32(archive, "g_theta", noe, 0.0)?;
        partition.g_factor = load_f32(archive, "g_factor", noe, 1.0)?;
        partition.g_threshold = load_f32(archive, "g_threshold", noe, 0.0)?;
        partition.g_amplification = load_f32(archive, "g_amplification", noe, 1.0)?;
        partition.g_min = load_f32(archive, "g_min", noe, 0.0)?;
        partition.g_max = load_f32(archive, "g_max", noe, 1.0)?;
        partition.g_function_selector = load_i8(archive, "g_function_selector", noe, 0)?;
        partition.g_expect = load_f32(archive, "g_expect", noe, 1.0)?;
        partition.g_countdown = load_i16(archive, "g_countdown", noe, 0)?;
        partition.g_wait = load_i16(archive, "g_wait", noe, 1)?;
        partition.n_function_selector = load_i8(archive, "n_function_selector", noe, 0)?;
        partition.n_node_porlinked = vec![0; noe];
        partition.n_node_retlinked = vec![0; noe];

        partition.sensor_indices = match archive.get_i32("sensor_indices")? {
            Some(values) => values.to_vec(),
            None => Vec::new(),
        };
        partition.actuator_indices = match archive.get_i32("actuator_indices")? {
            Some(values) => values.to_vec(),
            None => Vec::new(),
        };

        partition.load_inlinks(archive)?;

        // reconstruct capability flags from the loaded state
        partition.has_new_usages = true;
        partition.por_ret_dirty = true;
        partition.has_pipes = partition.allocated_nodes.contains(&nodetype::PIPE);
        partition.has_lstms = partition.allocated_nodes.contains(&nodetype::LSTM);
        partition.has_directional_activators = partition
            .nodespace_gate_activators
            .iter()
            .any(|table| table.iter().any(|&id| id != 0));
        partition.has_sampling_activators = partition
            .nodespace_sampling_activators
            .iter()
            .any(|&id| id != 0);
        let selector = |gf: GateFunction| gf.selector();
        partition.has_gatefunction_absolute = partition
            .g_function_selector
            .contains(&selector(GateFunction::Absolute));
        partition.has_gatefunction_sigmoid = partition
            .g_function_selector
            .contains(&selector(GateFunction::Sigmoid));
        partition.has_gatefunction_tanh = partition
            .g_function_selector
            .contains(&selector(GateFunction::Tanh));
        partition.has_gatefunction_rect = partition
            .g_function_selector
            .contains(&selector(GateFunction::Rect));
        partition.has_gatefunction_one_over_x = partition
            .g_function_selector
            .contains(&selector(GateFunction::Dist));

        Ok(partition)
    }

    fn load_inlinks(&mut self, archive: &ArrayArchive) -> Result<()> {
        let keys = (
            archive.get_i16("inlink_pids")?,
            archive.get_i32("inlink_from_lengths")?,
            archive.get_i32("inlink_to_lengths")?,
            archive.get_i32("inlink_from_elements")?,
            archive.get_i32("inlink_to_elements")?,
            archive.get_f32("inlink_weights")?,
        );
        let (Some(pids), Some(from_lengths), Some(to_lengths), Some(from_all), Some(to_all), Some(weights_all)) =
            keys
        else {
            if archive.contains("inlink_pids") {
                warn!("incomplete inlink information in file, no inter-partition links loaded");
            }
            return Ok(());
        };

        if from_lengths.len() != pids.len() || to_lengths.len() != pids.len() {
            return Err(EngineError::shape_mismatch(
                format!("{} inlink length entries", pids.len()),
                format!("{} / {}", from_lengths.len(), to_lengths.len()),
            ));
        }

        let mut from_offset = 0usize;
        let mut to_offset = 0usize;
        let mut weight_offset = 0usize;
        for (i, &pid) in pids.iter().enumerate() {
            if from_lengths[i] < 0 || to_lengths[i] < 0 {
                return Err(EngineError::shape_mismatch(
                    "non-negative inlink lengths".to_string(),
                    format!("block {}", i),
                ));
            }
            let from_len = from_lengths[i] as usize;
            let to_len = to_lengths[i] as usize;
            let weight_len = from_len * to_len;
            if from_offset + from_len > from_all.len()
                || to_offset + to_len > to_all.len()
                || weight_offset + weight_len > weights_all.len()
            {
                return Err(EngineError::shape_mismatch(
                    "inlink blocks within stored arrays".to_string(),
                    format!("block {} overruns", i),
                ));
            }
            let from: Vec<u32> = from_all[from_offset..from_offset + from_len]
                .iter()
                .map(|&e| e as u32)
                .collect();
            let to: Vec<u32> = to_all[to_offset..to_offset + to_len]
                .iter()
                .map(|&e| e as u32)
                .collect();
            self.set_inlink_weights(
                pid as u32,
                &from,
                &to,
                &weights_all[weight_offset..weight_offset + weight_len],
                0,
            )?;
            from_offset += from_len;
            to_offset += to_len;
            weight_offset += weight_len;
        }
        Ok(())
    }
}

fn load_f32(archive: &ArrayArchive, name: &str, len: usize, default: f32) -> Result<Vec<f32>> {
    match archive.get_f32(name)? {
        Some(values) => {
            let mut out = values.to_vec();
            out.resize(len, default);
            Ok(out)
        }
        None => {
            warn!("no {} in file, falling back to defaults", name);
            Ok(vec![default; len])
        }
    }
}

fn load_i32(archive: &ArrayArchive, name: &str, len: usize, default: i32) -> Result<Vec<i32>> {
    match archive.get_i32(name)? {
        Some(values) => {
            let mut out = values.to_vec();
            out.resize(len, default);
            Ok(out)
        }
        None => {
            warn!("no {} in file, falling back to defaults", name);
            Ok(vec![default; len])
        }
    }
}

fn load_i16(archive: &ArrayArchive, name: &str, len: usize, default: i16) -> Result<Vec<i16>> {
    match archive.get_i16(name)? {
        Some(values) => {
            let mut out = values.to_vec();
            out.resize(len, default);
            Ok(out)
        }
        None => {
            warn!("no {} in file, falling back to defaults", name);
            Ok(vec![default; len])
        }
    }
}

fn load_i8(archive: &ArrayArchive, name: &str, len: usize, default: i8) -> Result<Vec<i8>> {
    match archive.get_i8(name)? {
        Some(values) => {
            let mut out = values.to_vec();
            out.resize(len, default);
            Ok(out)
        }
        None => {
            warn!("no {} in file, falling back to defaults", name);
            Ok(vec![default; len])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PartitionConfig {
        PartitionConfig {
            sparse: true,
            initial_number_of_nodes: 16,
            average_elements_per_node: 4,
            initial_number_of_nodespaces: 4,
        }
    }

    #[test]
    fn test_create_node_allocates_contiguous_elements() {
        let mut partition = Partition::new(0, &small_config());
        let pipe = partition
            .create_node(nodetype::PIPE, ROOT_NODESPACE, 0)
            .unwrap();
        let offset = partition.node_offset(pipe).unwrap();
        assert!(offset >= 1);
        for k in 0..7 {
            assert_eq!(
                partition.allocated_elements_to_nodes[offset + k],
                pipe as i32
            );
        }
        assert!(partition.integrity_check().is_empty());
    }

    #[test]
    fn test_element_zero_is_reserved() {
        let mut partition = Partition::new(0, &small_config());
        for _ in 0..8 {
            let id = partition
                .create_node(nodetype::REGISTER, ROOT_NODESPACE, 0)
                .unwrap();
            assert!(partition.node_offset(id).unwrap() >= 1);
            assert!(id >= 1);
        }
    }

    #[test]
    fn test_delete_node_releases_elements() {
        let mut partition = Partition::new(0, &small_config());
        let before = partition.used_element_count();
        let pipe = partition
            .create_node(nodetype::PIPE, ROOT_NODESPACE, 0)
            .unwrap();
        partition.delete_node(pipe, 1).unwrap();
        assert_eq!(partition.used_element_count(), before);
        assert!(!partition.is_node_live(pipe));
        assert!(partition.integrity_check().is_empty());
    }

    #[test]
    fn test_delete_node_zeroes_weights() {
        let mut partition = Partition::new(0, &small_config());
        let a = partition
            .create_node(nodetype::REGISTER, ROOT_NODESPACE, 0)
            .unwrap();
        let b = partition
            .create_node(nodetype::REGISTER, ROOT_NODESPACE, 0)
            .unwrap();
        partition.set_link_weight(a, 0, b, 0, 0.5, 0).unwrap();
        partition.set_link_weight(b, 0, a, 0, 0.25, 0).unwrap();
        partition.delete_node(a, 1).unwrap();
        assert_eq!(partition.link_count(), 0);
    }

    #[test]
    fn test_node_id_reuse() {
        let mut partition = Partition::new(0, &small_config());
        let first = partition
            .create_node(nodetype::REGISTER, ROOT_NODESPACE, 0)
            .unwrap();
        let used = partition.used_element_count();
        partition.delete_node(first, 1).unwrap();
        let second = partition
            .create_node(nodetype::REGISTER, ROOT_NODESPACE, 2)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(partition.used_element_count(), used);
    }

    #[test]
    fn test_growth_preserves_node_state(){
        let mut partition = Partition::new(0, &small_config());
        let register = partition
            .create_node(nodetype::REGISTER, ROOT_NODESPACE, 0)
            .unwrap();
        partition
            .set_link_weight(register, 0, register, 0, 0.5, 0)
            .unwrap();
        partition.set_activation(register, 0, 1.0, 0).unwrap();

        partition.grow_number_of_elements(64);
        partition.grow_number_of_nodes(16);

        assert_eq!(
            partition
                .get_link_weight(register, 0, register, 0)
                .unwrap(),
            0.5
        );
        assert_eq!(partition.get_activation(register, 0).unwrap(), 1.0);
        assert!(partition.integrity_check().is_empty());
    }

    #[test]
    fn test_allocation_grows_when_full() {
        let mut partition = Partition::new(
            0,
            &PartitionConfig {
                sparse: true,
                initial_number_of_nodes: 4,
                average_elements_per_node: 4,
                initial_number_of_nodespaces: 2,
            },
        );
        let mut ids = Vec::new();
        for _ in 0..24 {
            ids.push(
                partition
                    .create_node(nodetype::PIPE, ROOT_NODESPACE, 0)
                    .unwrap(),
            );
        }
        assert_eq!(partition.live_node_count(), 24);
        assert!(partition.number_of_elements() >= 24 * 7);
        assert!(partition.integrity_check().is_empty());
    }

    #[test]
    fn test_invalid_ids_fail_loudly() {
        let mut partition = Partition::new(0, &small_config());
        assert!(matches!(
            partition.delete_node(9, 0),
            Err(EngineError::InvalidId { .. })
        ));
        assert!(matches!(
            partition.create_node(nodetype::REGISTER, 3, 0),
            Err(EngineError::InvalidId { .. })
        ));
        assert!(matches!(
            partition.create_node(99, ROOT_NODESPACE, 0),
            Err(EngineError::InvalidType { .. })
        ));
    }

    #[test]
    fn test_link_validation() {
        let mut partition = Partition::new(0, &small_config());
        let register = partition
            .create_node(nodetype::REGISTER, ROOT_NODESPACE, 0)
            .unwrap();
        let pipe = partition
            .create_node(nodetype::PIPE, ROOT_NODESPACE, 0)
            .unwrap();
        // a register has one gate only
        assert!(matches!(
            partition.set_link_weight(register, 3, pipe, 0, 1.0, 0),
            Err(EngineError::InvalidGateOrSlot { .. })
        ));
        partition
            .set_link_weight(pipe, gate::SUB, register, 0, 1.0, 0)
            .unwrap();
        assert_eq!(
            partition
                .get_link_weight(pipe, gate::SUB, register, 0)
                .unwrap(),
            1.0
        );
    }

    #[test]
    fn test_por_linked_flags_follow_links() {
        let mut partition = Partition::new(0, &small_config());
        let source = partition
            .create_node(nodetype::PIPE, ROOT_NODESPACE, 0)
            .unwrap();
        let target = partition
            .create_node(nodetype::PIPE, ROOT_NODESPACE, 0)
            .unwrap();
        let offset = partition.node_offset(target).unwrap();

        partition
            .set_link_weight(source, gate::POR, target, gate::POR, 1.0, 0)
            .unwrap();
        for k in 0..7 {
            assert_eq!(partition.n_node_porlinked[offset + k], 1);
        }

        partition
            .set_link_weight(source, gate::POR, target, gate::POR, 0.0, 0)
            .unwrap();
        for k in 0..7 {
            assert_eq!(partition.n_node_porlinked[offset + k], 0);
        }

        // the rebuild reaches the same state from scratch
        partition
            .set_link_weight(source, gate::POR, target, gate::POR, 0.7, 0)
            .unwrap();
        partition.rebuild_por_linked();
        for k in 0..7 {
            assert_eq!(partition.n_node_porlinked[offset + k], 1);
        }
    }

    #[test]
    fn test_groups_and_bulk_access() {
        let mut partition = Partition::new(0, &small_config());
        let r1 = partition
            .create_node(nodetype::REGISTER, ROOT_NODESPACE, 0)
            .unwrap();
        let r2 = partition
            .create_node(nodetype::REGISTER, ROOT_NODESPACE, 0)
            .unwrap();
        partition
            .group_nodes_by_ids(ROOT_NODESPACE, &[r1, r2], "layer", gate::GEN)
            .unwrap();

        partition
            .set_activations(ROOT_NODESPACE, "layer", &[0.25, 0.5], 0)
            .unwrap();
        assert_eq!(
            partition.get_activations(ROOT_NODESPACE, "layer").unwrap(),
            vec![0.25, 0.5]
        );

        partition
            .set_link_weights(
                ROOT_NODESPACE,
                "layer",
                ROOT_NODESPACE,
                "layer",
                &[0.0, 0.1, 0.2, 0.3],
                0,
            )
            .unwrap();
        assert_eq!(
            partition
                .get_link_weights(ROOT_NODESPACE, "layer", ROOT_NODESPACE, "layer")
                .unwrap(),
            vec![0.0, 0.1, 0.2, 0.3]
        );
        assert_eq!(partition.get_link_weight(r2, 0, r1, 0).unwrap(), 0.1);

        assert!(matches!(
            partition.set_activations(ROOT_NODESPACE, "layer", &[1.0], 0),
            Err(EngineError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            partition.get_activations(ROOT_NODESPACE, "missing"),
            Err(EngineError::InvalidGroup { .. })
        ));

        partition.ungroup_nodes(ROOT_NODESPACE, "layer");
        assert!(partition.get_activations(ROOT_NODESPACE, "layer").is_err());
    }

    #[test]
    fn test_nodespace_recursion() {
        let mut partition = Partition::new(0, &small_config());
        let inner = partition.create_nodespace(ROOT_NODESPACE, 0).unwrap();
        let deeper = partition.create_nodespace(inner, 0).unwrap();
        let node = partition.create_node(nodetype::REGISTER, deeper, 0).unwrap();

        partition.delete_nodespace(inner, 1).unwrap();
        assert!(!partition.is_nodespace_live(inner));
        assert!(!partition.is_nodespace_live(deeper));
        assert!(!partition.is_node_live(node));
        assert!(matches!(
            partition.delete_nodespace(ROOT_NODESPACE, 1),
            Err(EngineError::InvalidId { .. })
        ));
    }

    #[test]
    fn test_change_tracking() {
        let mut partition = Partition::new(0, &small_config());
        let node = partition
            .create_node(nodetype::REGISTER, ROOT_NODESPACE, 5)
            .unwrap();
        assert!(partition.has_nodespace_changes(ROOT_NODESPACE, 5).unwrap());
        assert!(!partition.has_nodespace_changes(ROOT_NODESPACE, 6).unwrap());

        partition.set_activation(node, 0, 1.0, 8).unwrap();
        let (nodes, _) = partition.get_nodespace_changes(ROOT_NODESPACE, 8).unwrap();
        assert_eq!(nodes, vec![node]);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut partition = Partition::new(3, &small_config());
        let pipe = partition
            .create_node(nodetype::PIPE, ROOT_NODESPACE, 0)
            .unwrap();
        let register = partition
            .create_node(nodetype::REGISTER, ROOT_NODESPACE, 0)
            .unwrap();
        partition
            .set_link_weight(register, 0, pipe, gate::SUB, 0.8, 0)
            .unwrap();
        partition.set_activation(register, 0, 0.6, 0).unwrap();
        partition
            .set_inlink_weights(1, &[2, 4], &[1], &[0.5, 0.25], 0)
            .unwrap();

        let archive = partition.save();
        let loaded = Partition::load(3, &archive).unwrap();

        assert_eq!(loaded.pid(), 3);
        assert_eq!(loaded.number_of_elements(), partition.number_of_elements());
        assert_eq!(loaded.allocated_nodes, partition.allocated_nodes);
        assert_eq!(loaded.a, partition.a);
        assert_eq!(loaded.g_wait, partition.g_wait);
        assert_eq!(loaded.n_function_selector, partition.n_function_selector);
        assert_eq!(
            loaded.get_link_weight(register, 0, pipe, gate::SUB).unwrap(),
            0.8
        );
        assert_eq!(loaded.inlinks.len(), 1);
        assert_eq!(loaded.inlinks[&1].weight_between(2, 1), 0.5);
        assert!(loaded.has_pipes);
    }

    #[test]
    fn test_load_defaults_missing_arrays() {
        let partition = Partition::new(0, &small_config());
        let mut archive = partition.save();
        let full = Partition::load(0, &archive).unwrap();

        // strip a required key; the loader warns and defaults
        let mut stripped = ArrayArchive::new();
        for name in archive.names().map(str::to_string).collect::<Vec<_>>() {
            if name != "g_theta" {
                stripped.insert(name.clone(), archive.get(&name).unwrap().clone());
            }
        }
        archive = stripped;
        let loaded = Partition::load(0, &archive).unwrap();
        assert_eq!(loaded.g_theta, full.g_theta);
    }
}
