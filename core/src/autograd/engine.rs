use super::GraphNode;
use crate::error::Result;
use std::collections::HashSet;
use std::rc::Rc;

/// Runs `backward` on every node reachable from `root`, outputs before inputs.
///
/// The first failing node aborts the pass; gradients already accumulated are left as they are.
pub fn backward(root: Option<Rc<dyn GraphNode>>) -> Result<()> {
    let Some(root) = root else { return Ok(()) };

    let mut topo = Vec::new();
    let mut visited = HashSet::new();
    build_topo(root, &mut topo, &mut visited);

    for node in topo.into_iter().rev() {
        node.backward()?;
    }
    Ok(())
}

fn build_topo(
    node: Rc<dyn GraphNode>,
    topo: &mut Vec<Rc<dyn GraphNode>>,
    visited: &mut HashSet<*const ()>,
) {
    // Identity is the data pointer of the trait object.
    let ptr = Rc::as_ptr(&node) as *const ();
    if !visited.insert(ptr) {
        return;
    }

    for parent in node.parents() {
        build_topo(parent, topo, visited);
    }

    topo.push(node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug)]
    struct Recorder {
        name: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
        parents: Vec<Rc<dyn GraphNode>>,
    }

    impl GraphNode for Recorder {
        fn backward(&self) -> Result<()> {
            self.log.borrow_mut().push(self.name);
            Ok(())
        }

        fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
            self.parents.clone()
        }
    }

    #[test]
    fn test_diamond_visits_each_node_once_outputs_first() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let leaf: Rc<dyn GraphNode> = Rc::new(Recorder {
            name: "leaf",
            log: log.clone(),
            parents: vec![],
        });
        let left: Rc<dyn GraphNode> = Rc::new(Recorder {
            name: "left",
            log: log.clone(),
            parents: vec![leaf.clone()],
        });
        let right: Rc<dyn GraphNode> = Rc::new(Recorder {
            name: "right",
            log: log.clone(),
            parents: vec![leaf.clone()],
        });
        let root: Rc<dyn GraphNode> = Rc::new(Recorder {
            name: "root",
            log: log.clone(),
            parents: vec![left, right],
        });

        backward(Some(root)).unwrap();
        let order = log.borrow().clone();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "root");
        assert_eq!(order[3], "leaf");
    }

    #[test]
    fn test_no_root_is_noop() {
        assert!(backward(None).is_ok());
    }
}
