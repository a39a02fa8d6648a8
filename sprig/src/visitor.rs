use crate::{HeapObject, ObjectBody, Stack, Value};

pub trait Visitable {
    fn visit_edges(&self, visitor: &mut impl Visitor);
}

pub trait Visitor: Sized {
    fn visit(&mut self, value: Value);
}

// Idea:
// visiting an object means we visit only its direct edges.
// smis are handed to the visitor too, filtering is the visitor's business.
impl Visitable for HeapObject {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        visitor.visit(self.class);
        match &self.body {
            ObjectBody::Instance(fields) | ObjectBody::Array(fields) => {
                fields.iter().for_each(|&field| visitor.visit(field));
            }
            ObjectBody::Boxed(value) => visitor.visit(*value),
            ObjectBody::Initializer(function) => visitor.visit(*function),
            ObjectBody::Coroutine(coroutine) => {
                visitor.visit(coroutine.caller);
                if let Some(stack) = &coroutine.stack {
                    stack.visit_edges(visitor);
                }
            }
            ObjectBody::Class(class) => {
                if let Some(superclass) = class.superclass {
                    visitor.visit(superclass);
                }
                class
                    .methods
                    .iter()
                    .for_each(|method| visitor.visit(method.function));
            }
            ObjectBody::Function(function) => {
                function
                    .literals
                    .iter()
                    .for_each(|&literal| visitor.visit(literal));
            }
            ObjectBody::LargeInteger(_) | ObjectBody::Double(_) | ObjectBody::String(_) => (),
        }
    }
}

impl Visitable for Stack {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        self.slots().iter().for_each(|&slot| visitor.visit(slot));
    }
}
