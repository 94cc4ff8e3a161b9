//! Node net: partitions plus the scheduler tick
//!
//! The net owns every partition behind its own reader-writer lock, runs the
//! phase sequence of a tick, carries the datasource/datatarget buffers and
//! the modulator table, and persists one archive file per partition plus a
//! small net-level archive.

use crate::error::{EngineError, Result};
use crate::native::{NativeModuleFactory, NodeTypeRegistry};
use crate::partition::{NodeDataResult, Partition, PartitionConfig};
use crate::types::{nodetype, GateFunction, GateParameter, NodeParameter};

use log::{info, warn};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use psynet_storage::ArrayArchive;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Name of the net-level archive file
const NET_FILE: &str = "net.npar";

/// A complete node net: partitions, scheduler state and host-facing buffers
#[derive(Debug)]
pub struct NodeNet {
    partitions: BTreeMap<u32, RwLock<Partition>>,
    next_partition_id: u32,
    current_step: i32,
    modulators: HashMap<String, f32>,
    registry: NodeTypeRegistry,
    datasource_values: Vec<f32>,
    datatarget_values: Vec<f32>,
}

impl Default for NodeNet {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeNet {
    /// Create an empty net
    pub fn new() -> Self {
        Self {
            partitions: BTreeMap::new(),
            next_partition_id: 0,
            current_step: 0,
            modulators: HashMap::new(),
            registry: NodeTypeRegistry::new(),
            datasource_values: Vec::new(),
            datatarget_values: Vec::new(),
        }
    }

    /// Register a native module type; returns its numeric node type
    pub fn register_native_module(
        &mut self,
        name: impl Into<String>,
        elements: usize,
        factory: NativeModuleFactory,
    ) -> i32 {
        let numeric_type = self.registry.register(name, elements, factory);
        for lock in self.partitions.values() {
            lock.write().declare_native_type(numeric_type, elements);
        }
        numeric_type
    }

    /// Numeric node type of a registered native module name
    pub fn native_type_by_name(&self, name: &str) -> Option<i32> {
        self.registry.type_by_name(name)
    }

    /// Create a partition; returns its id
    pub fn create_partition(&mut self, config: &PartitionConfig) -> u32 {
        let pid = self.next_partition_id;
        self.next_partition_id += 1;
        let mut partition = Partition::new(pid, config);
        for (numeric_type, elements) in self.registry.element_table() {
            partition.declare_native_type(numeric_type, elements);
        }
        self.partitions.insert(pid, RwLock::new(partition));
        pid
    }

    /// Ids of all partitions
    pub fn partition_ids(&self) -> Vec<u32> {
        self.partitions.keys().copied().collect()
    }

    /// Read access to a partition
    pub fn partition(&self, pid: u32) -> Result<RwLockReadGuard<'_, Partition>> {
        self.partitions
            .get(&pid)
            .map(|lock| lock.read())
            .ok_or_else(|| EngineError::invalid_partition(pid))
    }

    /// Write access to a partition
    pub fn partition_mut(&self, pid: u32) -> Result<RwLockWriteGuard<'_, Partition>> {
        self.partitions
            .get(&pid)
            .map(|lock| lock.write())
            .ok_or_else(|| EngineError::invalid_partition(pid))
    }

    // -- editing API ---------------------------------------------------------

    /// Create a node; native module types get an instance attached
    pub fn create_node(&self, pid: u32, node_type: i32, nodespace_id: u32) -> Result<u32> {
        let mut partition = self.partition_mut(pid)?;
        let id = partition.create_node(node_type, nodespace_id, self.current_step)?;
        if node_type > nodetype::MAX_STD_NODETYPE {
            let instance = self.registry.instantiate(node_type)?;
            partition.install_native_instance(id, instance)?;
        }
        Ok(id)
    }

    /// Delete a node
    pub fn delete_node(&self, pid: u32, node_id: u32) -> Result<()> {
        self.partition_mut(pid)?
            .delete_node(node_id, self.current_step)
    }

    /// Create a nodespace under a live parent
    pub fn create_nodespace(&self, pid: u32, parent_id: u32) -> Result<u32> {
        self.partition_mut(pid)?
            .create_nodespace(parent_id, self.current_step)
    }

    /// Delete a nodespace recursively
    pub fn delete_nodespace(&self, pid: u32, nodespace_id: u32) -> Result<()> {
        self.partition_mut(pid)?
            .delete_nodespace(nodespace_id, self.current_step)
    }

    /// Create or update a link, within one partition or across two
    #[allow(clippy::too_many_arguments)]
    pub fn set_link_weight(
        &self,
        source_pid: u32,
        source_node: u32,
        gate_index: usize,
        target_pid: u32,
        target_node: u32,
        slot_index: usize,
        weight: f32,
    ) -> Result<()> {
        if source_pid == target_pid {
            return self.partition_mut(source_pid)?.set_link_weight(
                source_node,
                gate_index,
                target_node,
                slot_index,
                weight,
                self.current_step,
            );
        }

        let from_element = {
            let source = self.partition(source_pid)?;
            source.gate_element(source_node, gate_index)? as u32
        };
        let mut target = self.partition_mut(target_pid)?;
        let to_element = target.slot_element(target_node, slot_index)? as u32;
        target.set_inlink_weights(
            source_pid,
            &[from_element],
            &[to_element],
            &[weight],
            self.current_step,
        )
    }

    /// Alias for link creation
    #[allow(clippy::too_many_arguments)]
    pub fn create_link(
        &self,
        source_pid: u32,
        source_node: u32,
        gate_index: usize,
        target_pid: u32,
        target_node: u32,
        slot_index: usize,
        weight: f32,
    ) -> Result<()> {
        self.set_link_weight(
            source_pid,
            source_node,
            gate_index,
            target_pid,
            target_node,
            slot_index,
            weight,
        )
    }

    /// Delete a link by zeroing its weight
    pub fn delete_link(
        &self,
        source_pid: u32,
        source_node: u32,
        gate_index: usize,
        target_pid: u32,
        target_node: u32,
        slot_index: usize,
    ) -> Result<()> {
        self.set_link_weight(
            source_pid,
            source_node,
            gate_index,
            target_pid,
            target_node,
            slot_index,
            0.0,
        )
    }

    /// Weight of a link, within one partition or across two
    pub fn get_link_weight(
        &self,
        source_pid: u32,
        source_node: u32,
        gate_index: usize,
        target_pid: u32,
        target_node: u32,
        slot_index: usize,
    ) -> Result<f32> {
        if source_pid == target_pid {
            return self.partition(source_pid)?.get_link_weight(
                source_node,
                gate_index,
                target_node,
                slot_index,
            );
        }
        let from_element = {
            let source = self.partition(source_pid)?;
            source.gate_element(source_node, gate_index)? as u32
        };
        let target = self.partition(target_pid)?;
        let to_element = target.slot_element(target_node, slot_index)? as u32;
        Ok(target
            .inlinks()
            .get(&source_pid)
            .map(|block| block.weight_between(from_element, to_element))
            .unwrap_or(0.0))
    }

    /// Set one gate parameter of a node
    pub fn set_node_gate_parameter(
        &self,
        pid: u32,
        node_id: u32,
        gate_index: usize,
        parameter: GateParameter,
        value: f32,
    ) -> Result<()> {
        self.partition_mut(pid)?.set_node_gate_parameter(
            node_id,
            gate_index,
            parameter,
            value,
            self.current_step,
        )
    }

    /// Select a gate transfer function by its stable name
    pub fn set_node_gatefunction_name(
        &self,
        pid: u32,
        node_id: u32,
        gate_index: usize,
        name: &str,
    ) -> Result<()> {
        let function = GateFunction::from_name(name)?;
        self.partition_mut(pid)?
            .set_node_gatefunction(node_id, gate_index, function, self.current_step)
    }

    /// Set a node-level parameter (Pipe nodes only)
    pub fn set_node_parameter(
        &self,
        pid: u32,
        node_id: u32,
        parameter: NodeParameter,
        value: f32,
    ) -> Result<()> {
        self.partition_mut(pid)?
            .set_node_parameter(node_id, parameter, value, self.current_step)
    }

    /// Assign a directional activator to a nodespace
    pub fn set_nodespace_gatetype_activator(
        &self,
        pid: u32,
        nodespace_id: u32,
        gate_index: usize,
        activator_id: u32,
    ) -> Result<()> {
        self.partition_mut(pid)?
            .set_nodespace_gatetype_activator(nodespace_id, gate_index, activator_id)
    }

    /// Assign a sampling activator to a nodespace
    pub fn set_nodespace_sampling_activator(
        &self,
        pid: u32,
        nodespace_id: u32,
        activator_id: u32,
    ) -> Result<()> {
        self.partition_mut(pid)?
            .set_nodespace_sampling_activator(nodespace_id, activator_id)
    }

    /// Define a named element group over nodes of one nodespace
    pub fn group_nodes_by_ids(
        &self,
        pid: u32,
        nodespace_id: u32,
        ids: &[u32],
        group_name: &str,
        gate_index: usize,
    ) -> Result<()> {
        self.partition_mut(pid)?
            .group_nodes_by_ids(nodespace_id, ids, group_name, gate_index)
    }

    /// Drop a named group
    pub fn ungroup_nodes(&self, pid: u32, nodespace_id: u32, group_name: &str) -> Result<()> {
        self.partition_mut(pid)?.ungroup_nodes(nodespace_id, group_name);
        Ok(())
    }

    /// Activations of a group
    pub fn get_activations(&self, pid: u32, nodespace_id: u32, group: &str) -> Result<Vec<f32>> {
        self.partition(pid)?.get_activations(nodespace_id, group)
    }

    /// Overwrite the activations of a group
    pub fn set_activations(
        &self,
        pid: u32,
        nodespace_id: u32,
        group: &str,
        values: &[f32],
    ) -> Result<()> {
        self.partition_mut(pid)?
            .set_activations(nodespace_id, group, values, self.current_step)
    }

    /// Thetas of a group
    pub fn get_thetas(&self, pid: u32, nodespace_id: u32, group: &str) -> Result<Vec<f32>> {
        self.partition(pid)?.get_thetas(nodespace_id, group)
    }

    /// Overwrite the thetas of a group
    pub fn set_thetas(
        &self,
        pid: u32,
        nodespace_id: u32,
        group: &str,
        values: &[f32],
    ) -> Result<()> {
        self.partition_mut(pid)?
            .set_thetas(nodespace_id, group, values, self.current_step)
    }

    /// Read the weight block between two groups of one partition
    pub fn get_link_weights(
        &self,
        pid: u32,
        nodespace_from: u32,
        group_from: &str,
        nodespace_to: u32,
        group_to: &str,
    ) -> Result<Vec<f32>> {
        self.partition(pid)?
            .get_link_weights(nodespace_from, group_from, nodespace_to, group_to)
    }

    /// Overwrite the weight block between two groups of one partition
    #[allow(clippy::too_many_arguments)]
    pub fn set_link_weights(
        &self,
        pid: u32,
        nodespace_from: u32,
        group_from: &str,
        nodespace_to: u32,
        group_to: &str,
        block: &[f32],
    ) -> Result<()> {
        self.partition_mut(pid)?.set_link_weights(
            nodespace_from,
            group_from,
            nodespace_to,
            group_to,
            block,
            self.current_step,
        )
    }

    /// Merge bulk cross-partition links into the destination's block
    pub fn set_inlink_weights(
        &self,
        source_pid: u32,
        target_pid: u32,
        from_elements: &[u32],
        to_elements: &[u32],
        weights: &[f32],
    ) -> Result<()> {
        if source_pid == target_pid {
            return Err(EngineError::cross_partition(
                "inlink blocks must connect two distinct partitions".to_string(),
            ));
        }
        {
            let source = self.partition(source_pid)?;
            for &from in from_elements {
                if from as usize >= source.number_of_elements() {
                    return Err(EngineError::shape_mismatch(
                        format!("from-elements below {}", source.number_of_elements()),
                        format!("{}", from),
                    ));
                }
            }
        }
        self.partition_mut(target_pid)?.set_inlink_weights(
            source_pid,
            from_elements,
            to_elements,
            weights,
            self.current_step,
        )
    }

    // -- snapshot API --------------------------------------------------------

    /// Read node state of one partition
    pub fn get_node_data(
        &self,
        pid: u32,
        nodespace_ids: Option<&[u32]>,
        ids: Option<&[u32]>,
        include_links: bool,
        include_followupnodes: bool,
    ) -> Result<NodeDataResult> {
        self.partition(pid)?
            .get_node_data(nodespace_ids, ids, include_links, include_followupnodes)
    }

    /// True if the nodespace contents changed at or after `since_step`
    pub fn has_nodespace_changes(&self, pid: u32, nodespace_id: u32, since_step: i32) -> Result<bool> {
        self.partition(pid)?
            .has_nodespace_changes(nodespace_id, since_step)
    }

    /// Nodes and nodespaces of a nodespace changed at or after `since_step`
    pub fn get_nodespace_changes(
        &self,
        pid: u32,
        nodespace_id: u32,
        since_step: i32,
    ) -> Result<(Vec<u32>, Vec<u32>)> {
        self.partition(pid)?
            .get_nodespace_changes(nodespace_id, since_step)
    }

    // -- datasources, datatargets, modulators --------------------------------

    /// Bind a sensor node to a fresh datasource slot; returns the slot
    pub fn bind_sensor(&mut self, pid: u32, node_id: u32) -> Result<usize> {
        let slot = self.datasource_values.len();
        self.partition_mut(pid)?.bind_sensor(slot, node_id)?;
        self.datasource_values.push(0.0);
        Ok(slot)
    }

    /// Bind an actuator node to a fresh datatarget slot; returns the slot
    pub fn bind_actuator(&mut self, pid: u32, node_id: u32) -> Result<usize> {
        let slot = self.datatarget_values.len();
        self.partition_mut(pid)?.bind_actuator(slot, node_id)?;
        self.datatarget_values.push(0.0);
        Ok(slot)
    }

    /// Overwrite the datasource feed consumed by sensors each tick
    pub fn write_datasources(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.datasource_values.len() {
            return Err(EngineError::shape_mismatch(
                format!("{} datasources", self.datasource_values.len()),
                format!("{} values", values.len()),
            ));
        }
        self.datasource_values.copy_from_slice(values);
        Ok(())
    }

    /// Current datasource feed
    pub fn read_datasources(&self) -> &[f32] {
        &self.datasource_values
    }

    /// Overwrite the datatarget buffer (actuators refill it each tick)
    pub fn write_datatargets(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.datatarget_values.len() {
            return Err(EngineError::shape_mismatch(
                format!("{} datatargets", self.datatarget_values.len()),
                format!("{} values", values.len()),
            ));
        }
        self.datatarget_values.copy_from_slice(values);
        Ok(())
    }

    /// Actuator outputs of the last tick
    pub fn read_datatargets(&self) -> &[f32] {
        &self.datatarget_values
    }

    /// Value of a modulator, 0 when unset
    pub fn get_modulator(&self, name: &str) -> f32 {
        self.modulators.get(name).copied().unwrap_or(0.0)
    }

    /// Set a modulator value
    pub fn set_modulator(&mut self, name: impl Into<String>, value: f32) {
        self.modulators.insert(name.into(), value);
    }

    // -- the tick ------------------------------------------------------------

    /// Current tick counter
    pub fn get_current_step(&self) -> i32 {
        self.current_step
    }

    /// Run one tick over all partitions
    ///
    /// Phases: cross-partition contributions into each destination's input
    /// vector (reading every source's activations as left by the previous
    /// dispatch; a barrier separates all reads from all writes), datasource
    /// feed, linear propagation, non-linear dispatch, native modules,
    /// datatarget collection, step increment. Cross-partition links thereby
    /// deliver with the same one-tick latency as local links.
    pub fn step(&mut self) -> Result<()> {
        let step = self.current_step;

        // phase barrier: collect every contribution before applying any
        let mut contributions: Vec<(u32, u32, Vec<f32>)> = Vec::new();
        for (&dst_pid, dst_lock) in &self.partitions {
            let dst = dst_lock.read();
            for (&src_pid, block) in dst.inlinks() {
                if block.is_empty() {
                    continue;
                }
                if src_pid == dst_pid {
                    contributions.push((dst_pid, src_pid, block.contribution(dst.activations())));
                    continue;
                }
                let src_lock = self.partitions.get(&src_pid).ok_or_else(|| {
                    EngineError::cross_partition(format!(
                        "partition {} holds links from unknown partition {}",
                        dst_pid, src_pid
                    ))
                })?;
                let src = src_lock.read();
                contributions.push((dst_pid, src_pid, block.contribution(src.activations())));
            }
        }
        for (dst_pid, src_pid, values) in contributions {
            if let Some(lock) = self.partitions.get(&dst_pid) {
                lock.write().apply_inlink_contribution(src_pid, &values);
            }
        }

        if !self.datasource_values.is_empty() {
            for lock in self.partitions.values() {
                lock.write().apply_sensor_inputs(&self.datasource_values);
            }
        }

        self.for_each_partition(|partition| partition.propagate());
        self.for_each_partition(|partition| partition.calculate(step));

        for lock in self.partitions.values() {
            lock.write().run_native_modules(step);
        }

        for lock in self.partitions.values() {
            lock.read()
                .collect_actuator_outputs(&mut self.datatarget_values);
        }

        self.current_step += 1;
        Ok(())
    }

    #[cfg(feature = "parallel")]
    fn for_each_partition(&self, f: impl Fn(&mut Partition) + Send + Sync) {
        let locks: Vec<&RwLock<Partition>> = self.partitions.values().collect();
        locks.par_iter().for_each(|lock| f(&mut lock.write()));
    }

    #[cfg(not(feature = "parallel"))]
    fn for_each_partition(&self, f: impl Fn(&mut Partition)) {
        for lock in self.partitions.values() {
            f(&mut lock.write());
        }
    }

    // -- persistence ---------------------------------------------------------

    /// Save the net as one archive per partition plus a net-level archive
    pub fn save<P: AsRef<Path>>(&self, directory: P) -> Result<()> {
        let directory = directory.as_ref();
        std::fs::create_dir_all(directory).map_err(psynet_storage::StorageError::from)?;

        let mut net_archive = ArrayArchive::new();
        net_archive.insert_i32("current_step", vec![self.current_step]);
        net_archive.insert_i32("next_partition_id", vec![self.next_partition_id as i32]);
        for (name, &value) in &self.modulators {
            net_archive.insert_f32(format!("modulator_{}", name), vec![value]);
        }
        net_archive.write_file(directory.join(NET_FILE))?;

        for (&pid, lock) in &self.partitions {
            let archive = lock.read().save();
            archive.write_file(directory.join(format!("partition_{:03}.npar", pid)))?;
        }
        info!(
            "Saved net at step {} with {} partitions to {}",
            self.current_step,
            self.partitions.len(),
            directory.display()
        );
        Ok(())
    }

    /// Load a net saved with [`NodeNet::save`]
    pub fn load<P: AsRef<Path>>(directory: P, registry: NodeTypeRegistry) -> Result<Self> {
        let directory = directory.as_ref();
        let mut net = Self::new();
        net.registry = registry;

        match ArrayArchive::read_file(directory.join(NET_FILE)) {
            Ok(archive) => {
                if let Some(step) = archive.get_i32("current_step")? {
                    net.current_step = step.first().copied().unwrap_or(0);
                }
                if let Some(next) = archive.get_i32("next_partition_id")? {
                    net.next_partition_id = next.first().copied().unwrap_or(0) as u32;
                }
                for name in archive.names().map(str::to_string).collect::<Vec<_>>() {
                    if let Some(modulator) = name.strip_prefix("modulator_") {
                        if let Some(value) = archive.get_f32(&name)? {
                            net.modulators
                                .insert(modulator.to_string(), value.first().copied().unwrap_or(0.0));
                        }
                    }
                }
            }
            Err(err) => {
                warn!("no readable net archive ({}), starting at step 0", err);
            }
        }

        let mut entries: Vec<(u32, std::path::PathBuf)> = Vec::new();
        let dir_reader = std::fs::read_dir(directory).map_err(psynet_storage::StorageError::from)?;
        for entry in dir_reader {
            let entry = entry.map_err(psynet_storage::StorageError::from)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(pid) = name
                .strip_prefix("partition_")
                .and_then(|rest| rest.strip_suffix(".npar"))
                .and_then(|digits| digits.parse::<u32>().ok())
            {
                entries.push((pid, entry.path()));
            }
        }
        entries.sort();

        for (pid, path) in entries {
            let archive = ArrayArchive::read_file(&path)?;
            let mut partition = Partition::load(pid, &archive)?;
            for (numeric_type, elements) in net.registry.element_table() {
                partition.declare_native_type(numeric_type, elements);
            }
            for node_id in partition.node_ids() {
                let node_type = partition.node_type(node_id)?;
                if node_type > nodetype::MAX_STD_NODETYPE {
                    match net.registry.instantiate(node_type) {
                        Ok(instance) => partition.install_native_instance(node_id, instance)?,
                        Err(_) => warn!(
                            "node {} in partition {} has unregistered native type {}",
                            node_id, pid, node_type
                        ),
                    }
                }
            }
            net.datasource_values
                .resize(net.datasource_values.len().max(partition.sensor_slot_count()), 0.0);
            net.datatarget_values
                .resize(net.datatarget_values.len().max(partition.actuator_slot_count()), 0.0);
            net.next_partition_id = net.next_partition_id.max(pid + 1);
            net.partitions.insert(pid, RwLock::new(partition));
        }

        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::ROOT_NODESPACE;

    fn small_config() -> PartitionConfig {
        PartitionConfig {
            sparse: true,
            initial_number_of_nodes: 16,
            average_elements_per_node: 4,
            initial_number_of_nodespaces: 4,
        }
    }

    #[test]
    fn test_single_partition_step() {
        let mut net = NodeNet::new();
        let pid = net.create_partition(&small_config());
        let register = net.create_node(pid, nodetype::REGISTER, ROOT_NODESPACE).unwrap();
        net.set_link_weight(pid, register, 0, pid, register, 0, 0.5)
            .unwrap();
        net.partition_mut(pid)
            .unwrap()
            .set_activation(register, 0, 1.0, 0)
            .unwrap();

        net.step().unwrap();
        assert_eq!(net.get_current_step(), 1);
        let value = net.partition(pid).unwrap().get_activation(register, 0).unwrap();
        assert!((value - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_cross_partition_link() {
        let mut net = NodeNet::new();
        let p = net.create_partition(&small_config());
        let q = net.create_partition(&small_config());
        let r_q = net.create_node(q, nodetype::REGISTER, ROOT_NODESPACE).unwrap();
        let r_p = net.create_node(p, nodetype::REGISTER, ROOT_NODESPACE).unwrap();

        net.set_link_weight(q, r_q, 0, p, r_p, 0, 2.0).unwrap();
        assert_eq!(net.get_link_weight(q, r_q, 0, p, r_p, 0).unwrap(), 2.0);

        net.partition_mut(q)
            .unwrap()
            .set_activation(r_q, 0, 0.25, 0)
            .unwrap();
        net.step().unwrap();
        let value = net.partition(p).unwrap().get_activation(r_p, 0).unwrap();
        assert!((value - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_inlink_rejects_same_partition() {
        let mut net = NodeNet::new();
        let pid = net.create_partition(&small_config());
        assert!(matches!(
            net.set_inlink_weights(pid, pid, &[1], &[1], &[1.0]),
            Err(EngineError::CrossPartitionOrder { .. })
        ));
    }

    #[test]
    fn test_sensors_and_actuators() {
        let mut net = NodeNet::new();
        let pid = net.create_partition(&small_config());
        let sensor = net.create_node(pid, nodetype::SENSOR, ROOT_NODESPACE).unwrap();
        let actuator = net.create_node(pid, nodetype::ACTUATOR, ROOT_NODESPACE).unwrap();
        net.bind_sensor(pid, sensor).unwrap();
        net.bind_actuator(pid, actuator).unwrap();
        net.set_link_weight(pid, sensor, 0, pid, actuator, 0, 1.0)
            .unwrap();

        net.write_datasources(&[0.75]).unwrap();
        net.step().unwrap();
        // first tick: the feed reaches the sensor
        let sensed = net.partition(pid).unwrap().get_activation(sensor, 0).unwrap();
        assert!((sensed - 0.75).abs() < 1e-6);
        net.step().unwrap();
        // second tick: the sensor's output reaches the actuator
        assert!((net.read_datatargets()[0] - 0.75).abs() < 1e-6);

        assert!(net.write_datasources(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_modulators() {
        let mut net = NodeNet::new();
        assert_eq!(net.get_modulator("arousal"), 0.0);
        net.set_modulator("arousal", 0.8);
        assert_eq!(net.get_modulator("arousal"), 0.8);
    }

    #[test]
    fn test_native_module_runs_after_dispatch() {
        #[derive(Debug)]
        struct Negator;
        impl crate::native::NativeModule for Negator {
            fn node_function(&mut self, ctx: &mut crate::native::NativeModuleContext<'_>) {
                ctx.gates[0] = -ctx.slots[0];
            }
        }

        let mut net = NodeNet::new();
        let negator_type = net.register_native_module("Negator", 1, Box::new(|| Box::new(Negator)));
        let pid = net.create_partition(&small_config());
        let register = net.create_node(pid, nodetype::REGISTER, ROOT_NODESPACE).unwrap();
        let negator = net.create_node(pid, negator_type, ROOT_NODESPACE).unwrap();
        net.set_link_weight(pid, register, 0, pid, negator, 0, 1.0)
            .unwrap();
        net.set_link_weight(pid, register, 0, pid, register, 0, 1.0)
            .unwrap();
        net.partition_mut(pid)
            .unwrap()
            .set_activation(register, 0, 0.5, 0)
            .unwrap();

        net.step().unwrap();
        let value = net
            .partition(pid)
            .unwrap()
            .get_activation(negator, 0)
            .unwrap();
        assert!((value + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut net = NodeNet::new();
        let pid = net.create_partition(&small_config());
        let register = net.create_node(pid, nodetype::REGISTER, ROOT_NODESPACE).unwrap();
        net.set_link_weight(pid, register, 0, pid, register, 0, 0.5)
            .unwrap();
        net.partition_mut(pid)
            .unwrap()
            .set_activation(register, 0, 1.0, 0)
            .unwrap();
        net.set_modulator("arousal", 0.25);
        net.step().unwrap();
        net.save(dir.path()).unwrap();

        let mut loaded = NodeNet::load(dir.path(), NodeTypeRegistry::new()).unwrap();
        assert_eq!(loaded.get_current_step(), 1);
        assert_eq!(loaded.get_modulator("arousal"), 0.25);

        net.step().unwrap();
        loaded.step().unwrap();
        let original = net.partition(pid).unwrap().get_activation(register, 0).unwrap();
        let resumed = loaded
            .partition(pid)
            .unwrap()
            .get_activation(register, 0)
            .unwrap();
        assert!((original - resumed).abs() < 1e-6);
    }
}
