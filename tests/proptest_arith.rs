//! Property tests: compiled trees must agree with direct evaluation of
//! the same arithmetic.

use proptest::prelude::*;

use arbor::{compile, BinaryOp, Expr, ExprRef, Type, Value, Var};

fn chain(ops: &[(u8, i64)]) -> (ExprRef, i64) {
    let mut expr = Expr::int(0);
    let mut acc = 0i64;
    for (op, n) in ops {
        let rhs = Expr::int(*n);
        match op % 3 {
            0 => {
                expr = Expr::binary(BinaryOp::Add, expr, rhs);
                acc = acc.wrapping_add(*n);
            }
            1 => {
                expr = Expr::binary(BinaryOp::Sub, expr, rhs);
                acc = acc.wrapping_sub(*n);
            }
            _ => {
                expr = Expr::binary(BinaryOp::Mul, expr, rhs);
                acc = acc.wrapping_mul(*n);
            }
        }
    }
    (expr, acc)
}

proptest! {
    #[test]
    fn compiled_chain_matches_direct_evaluation(
        ops in prop::collection::vec((0u8..3, -1000i64..1000), 1..60)
    ) {
        let (expr, expected) = chain(&ops);
        let lam = Expr::lambda(None, vec![], Type::Int, expr);
        let f = compile(&lam).unwrap();
        prop_assert_eq!(f.invoke(&[]).unwrap().to_int(), Some(expected));
    }

    #[test]
    fn compilation_is_deterministic(
        ops in prop::collection::vec((0u8..3, -50i64..50), 1..20)
    ) {
        let (expr, _) = chain(&ops);
        let lam = Expr::lambda(None, vec![], Type::Int, expr);
        let a = compile(&lam).unwrap().invoke(&[]).unwrap();
        let b = compile(&lam).unwrap().invoke(&[]).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn closure_addition_matches(a in -10_000i64..10_000, b in -10_000i64..10_000) {
        let x = Var::new("x", Type::Int);
        let y = Var::new("y", Type::Int);
        let inner = Expr::lambda(
            None,
            vec![y.clone()],
            Type::Int,
            Expr::add(Expr::variable(&x), Expr::variable(&y)),
        );
        let outer = Expr::lambda(None, vec![x.clone()], inner.ty().clone(), inner);
        let f = compile(&outer).unwrap();
        let g = f.invoke(&[Value::Int(a)]).unwrap();
        let g = g.as_function().unwrap();
        prop_assert_eq!(g.invoke(&[Value::Int(b)]).unwrap().to_int(), Some(a + b));
    }

    #[test]
    fn comparisons_match(a in -100i64..100, b in -100i64..100) {
        for (op, expected) in [
            (BinaryOp::Lt, a < b),
            (BinaryOp::Le, a <= b),
            (BinaryOp::Gt, a > b),
            (BinaryOp::Ge, a >= b),
            (BinaryOp::Eq, a == b),
            (BinaryOp::Ne, a != b),
        ] {
            let body = Expr::binary(op, Expr::int(a), Expr::int(b));
            let lam = Expr::lambda(None, vec![], Type::Bool, body);
            let f = compile(&lam).unwrap();
            prop_assert_eq!(f.invoke(&[]).unwrap().to_bool(), Some(expected));
        }
    }
}
