use hemocalc_engine::{estimate, fallback_ml, EstimateInput};
use proptest::prelude::*;

fn patient() -> impl Strategy<Value = (f64, f64)> {
    (120.0f64..220.0, 30.0f64..200.0)
}

proptest! {
    #[test]
    fn valid_inputs_give_non_negative_estimates(
        (height_cm, weight_kg) in patient(),
        hb_before in 1i32..250,
        drop in 1i32..250,
        duration_hours in 0.0f64..24.0,
        coeff in 0.0f64..5.0,
    ) {
        let hb_after = (hb_before - drop).max(0);
        prop_assume!(hb_after < hb_before);

        let ml = estimate(&EstimateInput {
            height_cm,
            weight_kg,
            hb_before,
            hb_after,
            duration_hours,
            coeff,
        })
        .unwrap();
        prop_assert!(ml >= 0);
    }

    #[test]
    fn estimate_is_monotonic_in_hemoglobin_drop(
        (height_cm, weight_kg) in patient(),
        hb_before in 2i32..250,
        duration_hours in 0.0f64..24.0,
        coeff in 0.0f64..5.0,
    ) {
        let mut previous = 0;
        for hb_after in (0..hb_before).rev() {
            let ml = estimate(&EstimateInput {
                height_cm,
                weight_kg,
                hb_before,
                hb_after,
                duration_hours,
                coeff,
            })
            .unwrap();
            prop_assert!(ml >= previous, "hb_after={hb_after}: {ml} < {previous}");
            previous = ml;
        }
    }

    #[test]
    fn estimate_is_monotonic_in_duration(
        (height_cm, weight_kg) in patient(),
        hb_before in 2i32..250,
        hb_after_frac in 0.0f64..1.0,
        coeff in 0.0f64..5.0,
        short in 0.0f64..12.0,
        extra in 0.0f64..12.0,
    ) {
        let hb_after = ((f64::from(hb_before) - 1.0) * hb_after_frac) as i32;
        let input = EstimateInput {
            height_cm,
            weight_kg,
            hb_before,
            hb_after,
            duration_hours: short,
            coeff,
        };
        let longer = EstimateInput {
            duration_hours: short + extra,
            ..input
        };
        prop_assert!(estimate(&longer).unwrap() >= estimate(&input).unwrap());
    }

    #[test]
    fn hemoglobin_not_dropping_is_rejected(
        (height_cm, weight_kg) in patient(),
        hb_before in 1i32..250,
        rise in 0i32..50,
        duration_hours in 0.0f64..24.0,
    ) {
        let result = estimate(&EstimateInput {
            height_cm,
            weight_kg,
            hb_before,
            hb_after: hb_before + rise,
            duration_hours,
            coeff: 0.1,
        });
        prop_assert!(result.is_err());
    }

    #[test]
    fn non_positive_anthropometrics_are_rejected(
        height_cm in -300.0f64..=0.0,
        weight_kg in -300.0f64..=0.0,
        negative_duration in -24.0f64..-0.001,
    ) {
        let base = EstimateInput {
            height_cm: 170.0,
            weight_kg: 70.0,
            hb_before: 140,
            hb_after: 100,
            duration_hours: 1.0,
            coeff: 0.1,
        };
        let short = EstimateInput { height_cm, ..base };
        let light = EstimateInput { weight_kg, ..base };
        let rewound = EstimateInput { duration_hours: negative_duration, ..base };
        prop_assert!(estimate(&short).is_err(), "height_cm={height_cm} accepted");
        prop_assert!(estimate(&light).is_err(), "weight_kg={weight_kg} accepted");
        prop_assert!(
            estimate(&rewound).is_err(),
            "duration_hours={negative_duration} accepted"
        );
    }

    #[test]
    fn fallback_is_total(coeff in any::<f64>(), avg in any::<i32>()) {
        let ml = fallback_ml(coeff, avg);
        prop_assert!(ml >= 0);
    }
}
