//! Climate-program compiler shared by both Binder controller dialects,
//! grounded line-by-line on `binder.py`'s `convert_chamber2binder`
//! (confirmed identical in the MB1 and MB2 variants except for
//! `segjump`'s base offset).

pub mod mb1;
pub mod mb2;

use ess_model::chamber::{ChamberProgram, DeviceSegment};
use ess_model::error::{EssError, Result};

/// Which controller dialect's `segjump` convention to use: MB1 jumps back
/// to the cycle-start segment itself, MB2 jumps to the segment after it
/// (its register map reserves index 0 of a cycle for the jump target).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegjumpBase {
    CycleStart,
    CycleStartPlusOne,
}

/// Lowers a declarative [`ChamberProgram`] into the device-segment stream,
/// carrying forward `(temp, humid, anticond)` across segment boundaries and
/// resolving cycle back-jumps by `repeat` count.
pub fn compile(program: &ChamberProgram, segjump_base: SegjumpBase) -> Result<Vec<DeviceSegment>> {
    let humidity_disabled = program.humidity.is_none();
    let mut temp = program.temperature;
    let mut humid = program.humidity;
    let mut anticond = program.anticond;

    let mut out: Vec<DeviceSegment> = Vec::new();
    let mut cycle_starts: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();
    let mut open_cycle_depth = 0usize;

    for (seg_index, segment) in program.segments.iter().enumerate() {
        if let Some(cycle) = program.cycles.iter().find(|c| c.start_index == seg_index) {
            cycle_starts.insert(seg_index, out.len());
            let _ = cycle;
            open_cycle_depth += 1;
        }

        if let Some(t) = segment.temperature {
            temp = t;
        }
        if segment.humidity.is_some() {
            humid = segment.humidity;
        }
        if let Some(a) = segment.anticond {
            anticond = a;
        }

        let device_start_index = out.len();
        out.push(DeviceSegment {
            temperature: temp,
            humidity: humid,
            duration: segment.duration,
            anticond,
            humidity_disabled,
            numjump: 0,
            segjump: 0,
        });

        if let Some(cycle) = program.cycles.iter().find(|c| c.end_index == seg_index) {
            open_cycle_depth = open_cycle_depth
                .checked_sub(1)
                .ok_or_else(|| EssError::Invariant(format!("cycle end at segment {seg_index} has no matching open cycle")))?;
            let device_cycle_start = *cycle_starts
                .get(&cycle.start_index)
                .ok_or_else(|| EssError::Invariant(format!("cycle end at segment {seg_index} references unknown start {}", cycle.start_index)))?;

            match cycle.repeat {
                0 => {
                    out.truncate(device_cycle_start);
                }
                1 => {
                    // no back-jump needed, segment stays as emitted
                }
                repeat => {
                    let last = out.last_mut().expect("segment just pushed above");
                    last.numjump = (repeat - 1) as u16;
                    last.segjump = match segjump_base {
                        SegjumpBase::CycleStart => device_cycle_start as u16,
                        SegjumpBase::CycleStartPlusOne => (device_cycle_start + 1) as u16,
                    };
                }
            }
        }

        let _ = device_start_index;
    }

    if open_cycle_depth != 0 {
        return Err(EssError::Invariant(format!(
            "program {} ends with {open_cycle_depth} unclosed cycle(s)",
            program.title
        )));
    }

    out.push(DeviceSegment::hold(temp, humid, anticond, humidity_disabled));

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ess_model::chamber::{ChamberSegment, Cycle};

    fn seg(duration: u32, temperature: Option<f64>) -> ChamberSegment {
        ChamberSegment {
            duration,
            temperature,
            humidity: None,
            anticond: None,
            meas: None,
        }
    }

    #[test]
    fn straight_line_program_has_trailing_hold() {
        let program = ChamberProgram {
            title: "ramp".to_string(),
            temperature: 20.0,
            humidity: Some(50.0),
            anticond: false,
            cycles: vec![],
            segments: vec![seg(60, Some(25.0)), seg(60, Some(30.0))],
        };
        let out = compile(&program, SegjumpBase::CycleStart).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].temperature, 25.0);
        assert_eq!(out[1].temperature, 30.0);
        assert_eq!(out[2].duration, 1);
        assert_eq!(out[2].temperature, 30.0);
    }

    #[test]
    fn repeat_zero_cycle_is_truncated_out() {
        let program = ChamberProgram {
            title: "skip".to_string(),
            temperature: 20.0,
            humidity: None,
            anticond: false,
            cycles: vec![Cycle {
                start_index: 1,
                repeat: 0,
                end_index: 2,
            }],
            segments: vec![seg(10, None), seg(10, Some(40.0)), seg(10, Some(45.0)), seg(10, Some(50.0))],
        };
        let out = compile(&program, SegjumpBase::CycleStart).unwrap();
        // segments 1 and 2 (the zero-repeat cycle) never appear; segment 0
        // and 3 plus the trailing hold remain
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].temperature, 20.0);
        assert_eq!(out[1].temperature, 50.0);
    }

    #[test]
    fn repeat_n_cycle_sets_numjump_and_segjump() {
        let program = ChamberProgram {
            title: "loop".to_string(),
            temperature: 20.0,
            humidity: None,
            anticond: false,
            cycles: vec![Cycle {
                start_index: 0,
                repeat: 3,
                end_index: 1,
            }],
            segments: vec![seg(10, Some(25.0)), seg(10, Some(30.0))],
        };
        let mb1 = compile(&program, SegjumpBase::CycleStart).unwrap();
        assert_eq!(mb1[1].numjump, 2);
        assert_eq!(mb1[1].segjump, 0);

        let mb2 = compile(&program, SegjumpBase::CycleStartPlusOne).unwrap();
        assert_eq!(mb2[1].segjump, 1);
    }

    #[test]
    fn unclosed_cycle_is_an_invariant_violation() {
        let program = ChamberProgram {
            title: "broken".to_string(),
            temperature: 20.0,
            humidity: None,
            anticond: false,
            cycles: vec![Cycle {
                start_index: 0,
                repeat: 2,
                end_index: 99,
            }],
            segments: vec![seg(10, Some(25.0))],
        };
        let err = compile(&program, SegjumpBase::CycleStart).unwrap_err();
        assert!(matches!(err, EssError::Invariant(_)));
    }
}
