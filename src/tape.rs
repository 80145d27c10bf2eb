use crate::tensor::Tensor;
use std::cell::RefCell;
use std::rc::Rc;

/// One recorded operation: which nodes fed it, and a closure that
/// propagates the output gradient back into the input buffers.
struct Node {
    parents: Vec<usize>,
    backward_fn: Rc<dyn Fn()>,
}

#[derive(Default)]
struct TapeInner {
    nodes: Vec<Node>,
}

thread_local! {
    static TAPE: RefCell<TapeInner> = RefCell::new(TapeInner::default());
}

pub struct Tape;

impl Tape {
    /// Clear all recorded operations. Call between training steps so the
    /// tape does not grow without bound.
    pub fn reset() {
        TAPE.with(|t| t.borrow_mut().nodes.clear());
    }

    pub fn len() -> usize {
        TAPE.with(|t| t.borrow().nodes.len())
    }

    /// Record an op with a single differentiable input.
    pub fn push_unary_op<F>(input: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        let parents = match input.tape_node.get() {
            Some(id) => vec![id],
            None => vec![],
        };
        let id = TAPE.with(|t| {
            let mut tape = t.borrow_mut();
            tape.nodes.push(Node {
                parents,
                backward_fn: Rc::new(backward_fn),
            });
            tape.nodes.len() - 1
        });
        output.tape_node.set(Some(id));
    }

    /// Record an op with two differentiable inputs.
    pub fn push_binary_op<F>(lhs: &Tensor, rhs: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        let mut parents = Vec::with_capacity(2);
        if let Some(id) = lhs.tape_node.get() {
            parents.push(id);
        }
        if let Some(id) = rhs.tape_node.get() {
            parents.push(id);
        }
        let id = TAPE.with(|t| {
            let mut tape = t.borrow_mut();
            tape.nodes.push(Node {
                parents,
                backward_fn: Rc::new(backward_fn),
            });
            tape.nodes.len() - 1
        });
        output.tape_node.set(Some(id));
    }
}

/// Run backward from `final_node`, visiting nodes in reverse recorded
/// order. The tape is topologically ordered by construction, so a
/// reverse scan over reachable nodes is a valid traversal.
pub fn backward(final_node: usize) {
    let n = TAPE.with(|t| t.borrow().nodes.len());
    if final_node >= n {
        return;
    }

    let mut reachable = vec![false; n];
    reachable[final_node] = true;

    for id in (0..=final_node).rev() {
        if !reachable[id] {
            continue;
        }
        let (f, parents) = TAPE.with(|t| {
            let tape = t.borrow();
            let node = &tape.nodes[id];
            (Rc::clone(&node.backward_fn), node.parents.clone())
        });
        // Closure is run outside the borrow so it may record nothing and
        // freely touch tensor grad buffers.
        f();
        for p in parents {
            reachable[p] = true;
        }
    }
}
