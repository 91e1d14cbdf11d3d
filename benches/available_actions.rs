use iai_callgrind::{library_benchmark, library_benchmark_group, main, LibraryBenchmarkConfig};
use std::hint::black_box;

use looptree::agent::LoopTreeAgent;
use looptree::common::DimSize;
use looptree::graph::matmul;

fn matmul_agent(size: u32) -> LoopTreeAgent {
    let size = DimSize::new(size).unwrap();
    let mut agent = LoopTreeAgent::new(matmul(size, size, size)).unwrap();
    for action in ["split_4", "down", "down", "split_2"] {
        agent.apply_action(action).unwrap();
    }
    agent
}

#[library_benchmark]
fn matmul_available_actions() {
    let agent = matmul_agent(512);
    black_box(agent.available_actions().unwrap());
}

#[library_benchmark]
fn serialize_round_trip() {
    let agent = matmul_agent(16);
    let text = agent.serialize().unwrap();
    black_box(LoopTreeAgent::deserialize(&text, agent.backend().clone()).unwrap());
}

library_benchmark_group!(
    name = agent_group;
    benchmarks = matmul_available_actions, serialize_round_trip
);

main!(
    config = LibraryBenchmarkConfig::default()
                .raw_callgrind_args([
                    "--simulate-wb=no", "--simulate-hwpref=yes",
                    "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64",
                ]);
    library_benchmark_groups = agent_group
);
