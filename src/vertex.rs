use crate::message::VertexId;

#[derive(Debug, Clone, PartialEq)]
pub struct Edge<E> {
    pub target: VertexId,
    pub value: E,
}

/// A vertex resident on a worker, with its outgoing edges.
#[derive(Debug, Clone)]
pub struct Vertex<V, E> {
    id: VertexId,
    pub value: V,
    active: bool,
    edges: Vec<Edge<E>>,
}

impl<V, E> Vertex<V, E> {
    pub fn new(id: VertexId, value: V) -> Self {
        Vertex {
            id,
            value,
            active: true,
            edges: Vec::new(),
        }
    }

    pub fn id(&self) -> &VertexId {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.id.key
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    /// Votes to halt. The vertex is computed again only when it receives a
    /// message.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn add_edge(&mut self, target: VertexId, value: E) {
        self.edges.push(Edge { target, value });
    }

    pub fn has_edge_to(&self, target: &VertexId) -> bool {
        self.edges.iter().any(|e| &e.target == target)
    }

    pub fn edges(&self) -> &[Edge<E>] {
        &self.edges
    }

    pub fn out_degree(&self) -> usize {
        self.edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_activation_and_edges() {
        let mut vertex: Vertex<f64, ()> = Vertex::new(VertexId::new("s1", "a"), 1.0);
        assert!(vertex.active());
        assert_eq!(vertex.key(), "a");

        vertex.add_edge(VertexId::new("s2", "b"), ());
        assert!(vertex.has_edge_to(&VertexId::new("s2", "b")));
        assert!(!vertex.has_edge_to(&VertexId::new("s1", "b")));
        assert_eq!(vertex.out_degree(), 1);

        vertex.deactivate();
        assert!(!vertex.active());
        vertex.activate();
        assert!(vertex.active());
    }
}
