pub use kiln_derive::ObjectTraversal;

/// Walks every string reachable from a value, letting the walker rewrite it.
///
/// Traversal stops at the first error the walker reports.
pub trait ObjectTraversal {
    fn traverse<W: ObjectWalker>(&mut self, walker: &mut W) -> Result<(), W::Error>;
}

pub trait ObjectWalker {
    type Error;

    fn enter_string(&mut self, value: &mut String) -> Result<(), Self::Error>;
}

impl<T: ObjectTraversal> ObjectTraversal for Vec<T> {
    fn traverse<W: ObjectWalker>(&mut self, walker: &mut W) -> Result<(), W::Error> {
        for item in self {
            item.traverse(walker)?;
        }

        Ok(())
    }
}

impl<T: ObjectTraversal> ObjectTraversal for Option<T> {
    fn traverse<W: ObjectWalker>(&mut self, walker: &mut W) -> Result<(), W::Error> {
        match self {
            Some(v) => v.traverse(walker),
            None => Ok(()),
        }
    }
}

impl ObjectTraversal for String {
    fn traverse<W: ObjectWalker>(&mut self, walker: &mut W) -> Result<(), W::Error> {
        walker.enter_string(self)
    }
}
