//! Per-request context handed through the middleware chain.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::Request;

/// Type-erased map for request-scoped values that one layer produces and a
/// later layer reads.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Per-request context: the parsed request plus its extensions.
pub struct Context {
    request: Request,
    extensions: Extensions,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            extensions: Extensions::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn into_request(self) -> Request {
        self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    #[derive(Debug, PartialEq)]
    struct Lookup(&'static str);

    #[test]
    fn extensions_are_keyed_by_type() {
        let mut ctx = Context::new(Request::new(Method::Get, "/products"));
        assert!(ctx.extensions().get::<Lookup>().is_none());

        assert_eq!(ctx.extensions_mut().insert(Lookup("miss")), None);
        assert_eq!(ctx.extensions_mut().insert(Lookup("hit")), Some(Lookup("miss")));
        assert_eq!(ctx.extensions().get::<Lookup>(), Some(&Lookup("hit")));
        assert_eq!(ctx.extensions_mut().remove::<Lookup>(), Some(Lookup("hit")));
        assert_eq!(ctx.request().path(), "/products");
    }
}
