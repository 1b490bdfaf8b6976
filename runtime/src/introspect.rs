//! Signature introspection
//!
//! [`Signature`] recovers a function's parameter list and return type from
//! its type alone. Everything here is resolved during monomorphisation; a
//! function that does not fit simply fails to implement the trait.

/// Parameter tuple and return type of a callable.
///
/// `Params` is the full parameter list as a tuple, in declaration order.
/// Implemented for every `Fn` of up to eleven parameters.
pub trait Signature<Params>: Send + Sync + 'static {
    type Return;

    /// Number of parameters
    const ARITY: usize;

    /// Call with a tuple built by the caller.
    ///
    /// The tuple is fully evaluated before the call starts, so any side
    /// effects of producing its elements have already happened in order.
    fn apply(&self, params: Params) -> Self::Return;

    /// Parameter type names, for diagnostics only
    fn param_type_names() -> Vec<&'static str>;
}

macro_rules! impl_signature {
    ($arity:expr; $($param:ident),*) => {
        impl<Func, Ret, $($param,)*> Signature<($($param,)*)> for Func
        where
            Func: Fn($($param),*) -> Ret + Send + Sync + 'static,
        {
            type Return = Ret;

            const ARITY: usize = $arity;

            #[inline]
            #[allow(non_snake_case, clippy::unused_unit)]
            fn apply(&self, ($($param,)*): ($($param,)*)) -> Ret {
                (self)($($param),*)
            }

            fn param_type_names() -> Vec<&'static str> {
                vec![$(std::any::type_name::<$param>()),*]
            }
        }
    };
}

impl_signature!(0;);
impl_signature!(1; P1);
impl_signature!(2; P1, P2);
impl_signature!(3; P1, P2, P3);
impl_signature!(4; P1, P2, P3, P4);
impl_signature!(5; P1, P2, P3, P4, P5);
impl_signature!(6; P1, P2, P3, P4, P5, P6);
impl_signature!(7; P1, P2, P3, P4, P5, P6, P7);
impl_signature!(8; P1, P2, P3, P4, P5, P6, P7, P8);
impl_signature!(9; P1, P2, P3, P4, P5, P6, P7, P8, P9);
impl_signature!(10; P1, P2, P3, P4, P5, P6, P7, P8, P9, P10);
impl_signature!(11; P1, P2, P3, P4, P5, P6, P7, P8, P9, P10, P11);

/// Arity of `F` viewed as a function of `Params`.
pub const fn arity_of<F, Params>(_f: &F) -> usize
where
    F: Signature<Params>,
{
    F::ARITY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{jint, jlong, JEnv, JObject};

    fn nullary() {}

    fn mixed(_env: JEnv, _this: JObject, a: jint, b: jlong) -> jlong {
        a as jlong + b
    }

    fn names_of<F, P>(_f: &F) -> Vec<&'static str>
    where
        F: Signature<P>,
    {
        F::param_type_names()
    }

    #[test]
    fn test_arity() {
        assert_eq!(arity_of(&nullary), 0);
        assert_eq!(arity_of(&mixed), 4);
    }

    #[test]
    fn test_apply_forwards_tuple() {
        let out = mixed.apply((JEnv::null(), JObject::null(), 2, 40));
        assert_eq!(out, 42);
    }

    #[test]
    fn test_param_type_names() {
        let names = names_of(&mixed);
        assert_eq!(names.len(), 4);
        assert_eq!(names[2], "i32");
        assert_eq!(names[3], "i64");
    }
}
