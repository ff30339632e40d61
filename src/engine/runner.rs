use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::Level;

use crate::core::Value;
use crate::engine::Node;
use crate::error::Error;
use crate::scope::Scope;

type Graph = DiGraph<Node, ()>;

/// Computes `targets`, returning their values in the same order.
pub(crate) fn run(targets: &[Node], scope: &Scope) -> Result<Vec<Value>, Error> {
    let mut graph = Graph::new();
    let mut indices = HashMap::new();

    for target in targets {
        insert(&mut graph, &mut indices, target);
    }

    let results = run_parallel(&graph, &indices, scope)?;

    Ok(targets
        .iter()
        .map(|target| results[&indices[target.key()]].clone())
        .collect())
}

/// Adds `node` and everything it depends on. Nodes are merged by key, so the
/// same computation reached through several paths runs once.
fn insert(graph: &mut Graph, indices: &mut HashMap<Arc<str>, NodeIndex>, node: &Node) -> NodeIndex {
    if let Some(&index) = indices.get(node.key()) {
        return index;
    }

    let index = graph.add_node(node.clone());
    indices.insert(node.0.key.clone(), index);

    for input in node.inputs() {
        let dependency = insert(graph, indices, input);
        graph.update_edge(dependency, index, ());
    }

    index
}

/// This function executes the graph using the rayon thread pool. Nodes are
/// executed as soon as all their inputs are available, while the calling
/// thread only schedules.
///
/// The algorithm works as follows:
/// 1. Count the inputs of every node.
/// 2. Spawn every node without inputs.
/// 3. Wait on a channel for finished nodes; store the value and decrement the
///    counters of every dependent node.
/// 4. Spawn each dependent whose counter reached zero.
/// 5. Stop when every node has finished, or at the first error.
fn run_parallel(
    graph: &Graph,
    indices: &HashMap<Arc<str>, NodeIndex>,
    scope: &Scope,
) -> Result<HashMap<NodeIndex, Value>, Error> {
    let mut dependency_counts: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|index| {
            let count = graph.neighbors_directed(index, Direction::Incoming).count();
            (index, count)
        })
        .collect();

    let total = graph.node_count();
    let mut results = HashMap::with_capacity(total);

    let root_span = tracing::span!(Level::INFO, "compute", nodes = total);
    let _enter = root_span.enter();
    let start = Instant::now();

    let (sender, receiver) = channel::<(NodeIndex, Result<Value, Error>, Duration)>();

    let spawn = |results: &HashMap<NodeIndex, Value>, index: NodeIndex| {
        let node = graph[index].clone();

        // Inputs are complete before a node becomes ready.
        let inputs: Vec<Value> = node
            .inputs()
            .iter()
            .map(|input| results[&indices[input.key()]].clone())
            .collect();

        let sender = sender.clone();
        let scope = scope.clone();
        let parent = root_span.clone();

        rayon::spawn(move || {
            let span = tracing::span!(
                parent: &parent,
                Level::INFO,
                "task",
                name = node.operation().name(),
                key = node.key()
            );
            let _enter = span.enter();

            let start = Instant::now();

            // The operation only sees cloned inputs and the shared scope,
            // a panic can't leave them half-updated.
            let output = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                node.operation().execute(node.key(), &inputs, &scope)
            })) {
                Ok(result) => result,
                Err(panic) => {
                    let message = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        String::from("unknown payload")
                    };

                    Err(Error::Panic {
                        key: node.key().to_string(),
                        message,
                    })
                }
            };

            // The receiver is gone only if the computation already failed.
            let _ = sender.send((index, output, start.elapsed()));
        });
    };

    for (&index, &count) in &dependency_counts {
        if count == 0 {
            spawn(&results, index);
        }
    }

    // Blocks the caller, which is why nodes must not compute nested graphs.
    let mut completed = 0;
    while completed < total {
        let Ok((index, output, elapsed)) = receiver.recv() else {
            break;
        };

        let value = output?;
        tracing::debug!(key = graph[index].key(), ?elapsed, "node finished");

        results.insert(index, value);
        completed += 1;

        for dependent in graph.neighbors_directed(index, Direction::Outgoing) {
            if let Some(count) = dependency_counts.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    spawn(&results, dependent);
                }
            }
        }
    }

    tracing::info!(nodes = total, elapsed = ?start.elapsed(), "computation complete");
    Ok(results)
}
