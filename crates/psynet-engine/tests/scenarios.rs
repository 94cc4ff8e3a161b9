//! End-to-end behaviour of the engine on small, hand-built nets

use psynet_engine::types::{gate, nodetype};
use psynet_engine::{NodeNet, NodeParameter, NodeTypeRegistry, PartitionConfig, ROOT_NODESPACE};

fn small_config() -> PartitionConfig {
    PartitionConfig {
        sparse: true,
        initial_number_of_nodes: 32,
        average_elements_per_node: 7,
        initial_number_of_nodespaces: 4,
    }
}

#[test]
fn register_feedback_decays_geometrically() {
    let mut net = NodeNet::new();
    let pid = net.create_partition(&small_config());
    let register = net
        .create_node(pid, nodetype::REGISTER, ROOT_NODESPACE)
        .unwrap();
    net.set_link_weight(pid, register, 0, pid, register, 0, 0.5)
        .unwrap();
    net.partition_mut(pid)
        .unwrap()
        .set_activation(register, 0, 1.0, 0)
        .unwrap();

    for _ in 0..5 {
        net.step().unwrap();
    }
    let value = net
        .partition(pid)
        .unwrap()
        .get_activation(register, 0)
        .unwrap();
    assert!((value - 0.03125).abs() < 1e-6);
}

#[test]
fn pipe_confirms_on_expected_sur() {
    let mut net = NodeNet::new();
    let pid = net.create_partition(&small_config());
    let pipe = net.create_node(pid, nodetype::PIPE, ROOT_NODESPACE).unwrap();
    net.set_node_parameter(pid, pipe, NodeParameter::Wait, 3.0)
        .unwrap();
    net.set_node_parameter(pid, pipe, NodeParameter::Expectation, 1.0)
        .unwrap();

    {
        let mut partition = net.partition_mut(pid).unwrap();
        partition.add_external_input(pipe, gate::SUB, 1.0).unwrap();
        partition.add_external_input(pipe, gate::SUR, 1.0).unwrap();
    }
    net.step().unwrap();

    let partition = net.partition(pid).unwrap();
    assert!((partition.get_activation(pipe, gate::SUR).unwrap() - 1.0).abs() < 1e-6);
    let sur_element = partition.element_index(pipe, gate::SUR).unwrap();
    assert_eq!(partition.countdowns()[sur_element], 3);
}

#[test]
fn pipe_times_out_without_sur() {
    let mut net = NodeNet::new();
    let pid = net.create_partition(&small_config());
    let pipe = net.create_node(pid, nodetype::PIPE, ROOT_NODESPACE).unwrap();
    net.set_node_parameter(pid, pipe, NodeParameter::Wait, 3.0)
        .unwrap();

    // one idle tick arms the countdown at its wait value
    net.step().unwrap();
    let sur_element = net
        .partition(pid)
        .unwrap()
        .element_index(pipe, gate::SUR)
        .unwrap();
    assert_eq!(net.partition(pid).unwrap().countdowns()[sur_element], 3);

    // sub requested, sur never confirms: the countdown drains tick by tick
    for expected in [2, 1, 0] {
        net.partition_mut(pid)
            .unwrap()
            .add_external_input(pipe, gate::SUB, 1.0)
            .unwrap();
        net.step().unwrap();
        let partition = net.partition(pid).unwrap();
        assert_eq!(partition.countdowns()[sur_element], expected);
        assert_eq!(partition.get_activation(pipe, gate::SUR).unwrap(), 0.0);
    }

    // drained: the sur gate reports failure and stays there
    for _ in 0..3 {
        net.partition_mut(pid)
            .unwrap()
            .add_external_input(pipe, gate::SUB, 1.0)
            .unwrap();
        net.step().unwrap();
        let value = net
            .partition(pid)
            .unwrap()
            .get_activation(pipe, gate::SUR)
            .unwrap();
        assert_eq!(value, -1.0);
    }
}

#[test]
fn directional_activator_gates_sub_outputs() {
    let mut net = NodeNet::new();
    let pid = net.create_partition(&small_config());
    let nodespace = net.create_nodespace(pid, ROOT_NODESPACE).unwrap();
    let pipe_a = net.create_node(pid, nodetype::PIPE, nodespace).unwrap();
    let pipe_b = net.create_node(pid, nodetype::PIPE, nodespace).unwrap();
    let activator = net
        .create_node(pid, nodetype::ACTIVATOR, nodespace)
        .unwrap();
    net.set_nodespace_gatetype_activator(pid, nodespace, gate::SUB, activator)
        .unwrap();

    let feed = |net: &NodeNet, activator_level: f32| {
        let mut partition = net.partition_mut(pid).unwrap();
        for pipe in [pipe_a, pipe_b] {
            partition.add_external_input(pipe, gate::SUB, 1.0).unwrap();
        }
        partition
            .add_external_input(activator, gate::GEN, activator_level)
            .unwrap();
    };

    // activator at zero: sub outputs are suppressed regardless of input
    for _ in 0..3 {
        feed(&net, 0.0);
        net.step().unwrap();
        let partition = net.partition(pid).unwrap();
        for pipe in [pipe_a, pipe_b] {
            assert_eq!(partition.get_activation(pipe, gate::SUB).unwrap(), 0.0);
        }
    }

    // activator at one: outputs flow
    feed(&net, 1.0);
    net.step().unwrap();
    let partition = net.partition(pid).unwrap();
    for pipe in [pipe_a, pipe_b] {
        assert!((partition.get_activation(pipe, gate::SUB).unwrap() - 1.0).abs() < 1e-6);
    }
}

#[test]
fn cross_partition_link_delivers_in_one_tick() {
    let mut net = NodeNet::new();
    let p = net.create_partition(&small_config());
    let q = net.create_partition(&small_config());
    let r_q = net.create_node(q, nodetype::REGISTER, ROOT_NODESPACE).unwrap();
    let r_p = net.create_node(p, nodetype::REGISTER, ROOT_NODESPACE).unwrap();
    net.set_link_weight(q, r_q, 0, p, r_p, 0, 2.0).unwrap();

    net.partition_mut(q)
        .unwrap()
        .set_activation(r_q, 0, 0.25, 0)
        .unwrap();
    net.step().unwrap();

    let value = net.partition(p).unwrap().get_activation(r_p, 0).unwrap();
    assert!((value - 0.5).abs() < 1e-6);
}

#[test]
fn lstm_samples_every_third_tick_and_holds_between() {
    let mut net = NodeNet::new();
    let pid = net.create_partition(&small_config());
    let lstm = net.create_node(pid, nodetype::LSTM, ROOT_NODESPACE).unwrap();

    // tick at t = 0 samples: the input gate reads sigmoid(0) = 0.5
    net.step().unwrap();
    let gin = net
        .partition(pid)
        .unwrap()
        .get_activation(lstm, gate::GIN)
        .unwrap();
    assert!((gin - 0.5).abs() < 1e-6);

    // t = 1, 2 hold the previous output
    for _ in 0..2 {
        net.step().unwrap();
        let held = net
            .partition(pid)
            .unwrap()
            .get_activation(lstm, gate::GIN)
            .unwrap();
        assert!((held - 0.5).abs() < 1e-6);
    }
}

#[test]
fn random_net_roundtrip_resumes_identically() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let config = PartitionConfig {
        sparse: true,
        initial_number_of_nodes: 256,
        average_elements_per_node: 7,
        initial_number_of_nodespaces: 4,
    };

    let mut net = NodeNet::new();
    let pid = net.create_partition(&config);

    let mut nodes = Vec::new();
    for index in 0..200 {
        let node_type = if index < 50 {
            nodetype::PIPE
        } else if index < 55 {
            nodetype::LSTM
        } else {
            nodetype::REGISTER
        };
        nodes.push((
            net.create_node(pid, node_type, ROOT_NODESPACE).unwrap(),
            node_type,
        ));
    }

    let channels = |node_type: i32| match node_type {
        nodetype::PIPE => 7,
        nodetype::LSTM => 5,
        _ => 1,
    };
    for _ in 0..600 {
        let (source, source_type) = nodes[rng.gen_range(0..nodes.len())];
        let (target, target_type) = nodes[rng.gen_range(0..nodes.len())];
        let gate_index = rng.gen_range(0..channels(source_type));
        let slot_index = rng.gen_range(0..channels(target_type));
        let weight = rng.gen_range(-1.0..1.0);
        net.set_link_weight(pid, source, gate_index, pid, target, slot_index, weight)
            .unwrap();
    }
    {
        let mut partition = net.partition_mut(pid).unwrap();
        for &(node, node_type) in &nodes {
            if node_type == nodetype::REGISTER {
                partition
                    .set_activation(node, 0, rng.gen_range(0.0..1.0), 0)
                    .unwrap();
            }
        }
    }

    for _ in 0..20 {
        net.step().unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    net.save(dir.path()).unwrap();
    let mut resumed = NodeNet::load(dir.path(), NodeTypeRegistry::new()).unwrap();
    assert_eq!(resumed.get_current_step(), net.get_current_step());

    for _ in 0..20 {
        net.step().unwrap();
        resumed.step().unwrap();
    }

    let original = net.partition(pid).unwrap();
    let reloaded = resumed.partition(pid).unwrap();
    assert_eq!(original.countdowns(), reloaded.countdowns());
    let a = original.activations();
    let b = reloaded.activations();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < 1e-6, "activation drift: {} vs {}", x, y);
    }
}
