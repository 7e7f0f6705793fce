use proptest::prelude::*;

use he_dispatch::{Context, ContextParams, OpaqueValue, SimEngine};

const T: i64 = 65537;

fn bfv() -> Context<SimEngine> {
    let params = ContextParams::bfv(16, T as u64, vec![40, 40, 40]);
    Context::new(SimEngine::new(params).unwrap().with_relin_keys().with_rotation_keys())
}

fn centred(x: i64) -> i64 {
    let r = x.rem_euclid(T);
    if r > T / 2 {
        r - T
    } else {
        r
    }
}

proptest! {
    #[test]
    fn bfv_ops_match_modular_arithmetic(a in -30000i64..30000, b in -30000i64..30000) {
        let ctx = bfv();
        let x = ctx.encrypt_int(a).unwrap();
        let y = ctx.encrypt_int(b).unwrap();
        prop_assert_eq!(ctx.decrypt_int(&x.add(&y).unwrap()).unwrap(), centred(a + b));
        prop_assert_eq!(ctx.decrypt_int(&x.sub(&y).unwrap()).unwrap(), centred(a - b));
        prop_assert_eq!(ctx.decrypt_int(&x.mul(&y).unwrap()).unwrap(), centred(a * b));
        prop_assert_eq!(ctx.decrypt_int(&x.mul(b).unwrap()).unwrap(), centred(a * b));
    }

    #[test]
    fn new_value_forms_leave_receiver_alone(values in prop::collection::vec(-100i64..100, 1..16), k in -20i32..20) {
        let ctx = bfv();
        let x = ctx.encrypt_batch(&values).unwrap();
        let before = (x.info(), x.to_bytes().unwrap());
        let _ = x.rotate(k).unwrap();
        let _ = x.mul(&x).unwrap();
        let _ = x.negate().unwrap();
        prop_assert_eq!((x.info(), x.to_bytes().unwrap()), before);
    }

    #[test]
    fn rotation_by_period_is_identity(values in prop::collection::vec(-100i64..100, 1..16), turns in -3i32..3) {
        let ctx = bfv();
        let x = ctx.encrypt_batch(&values).unwrap();
        let period = (ctx.slot_count() / 2) as i32;
        let r = x.rotate(turns * period).unwrap();
        prop_assert_eq!(ctx.decrypt_batch(&r).unwrap(), ctx.decrypt_batch(&x).unwrap());
    }

    #[test]
    fn ckks_scalar_division_inverts_multiplication(v in 0.5f64..100.0, d in 1.0f64..8.0) {
        let params = ContextParams::ckks(16, 2f64.powi(30), vec![60, 30, 30, 60]);
        let ctx = Context::new(SimEngine::new(params).unwrap().with_seed(9));
        let x = ctx.encrypt_frac(&[v]).unwrap();
        let mut q = x.div(d).unwrap();
        q.rescale_to_next().unwrap();
        let out = ctx.decrypt_frac(&q).unwrap()[0];
        prop_assert!((out - v / d).abs() < 1e-3, "{} / {} gave {}", v, d, out);
    }
}
