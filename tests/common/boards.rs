use flowboard::graph::{Edge, GraphDescriptor, NodeDescriptor};

/// input -> uppercase -> output, all on the `text` port.
pub fn linear_board() -> GraphDescriptor {
    GraphDescriptor {
        title: Some("linear".to_string()),
        nodes: vec![
            NodeDescriptor::new("ask", "input"),
            NodeDescriptor::new("shout", "uppercase"),
            NodeDescriptor::new("answer", "output"),
        ],
        edges: vec![
            Edge::new("ask", "shout").ports("text", "text"),
            Edge::new("shout", "answer").ports("text", "text"),
        ],
        ..Default::default()
    }
}

/// A board whose middle section is a cycle: input feeds `a`, the cycle
/// a -> b -> a runs until `b` emits `done`, which reaches the output.
pub fn cyclic_board() -> GraphDescriptor {
    GraphDescriptor {
        title: Some("cyclic".to_string()),
        nodes: vec![
            NodeDescriptor::new("start", "input"),
            NodeDescriptor::new("a", "echo"),
            NodeDescriptor::new("b", "echo"),
            NodeDescriptor::new("finish", "output"),
        ],
        edges: vec![
            Edge::new("start", "a").ports("text", "text"),
            Edge::new("a", "b").ports("text", "text"),
            Edge::new("b", "a").ports("again", "text"),
            Edge::new("b", "finish").ports("text", "text"),
        ],
        ..Default::default()
    }
}

/// Two independent branches: `left` fails, `right` succeeds.
pub fn two_branch_board() -> GraphDescriptor {
    GraphDescriptor {
        nodes: vec![
            NodeDescriptor::new("ask", "input"),
            NodeDescriptor::new("left", "fail"),
            NodeDescriptor::new("right", "uppercase"),
            NodeDescriptor::new("left-out", "output"),
            NodeDescriptor::new("right-out", "output"),
        ],
        edges: vec![
            Edge::new("ask", "left").ports("text", "text"),
            Edge::new("ask", "right").ports("text", "text"),
            Edge::new("left", "left-out").ports("text", "text"),
            Edge::new("right", "right-out").ports("text", "text"),
        ],
        ..Default::default()
    }
}
