//! 多模式触发词匹配（Horspool）
//!
//! 所有模式共用一张“坏字符”位移表，每个模式匹配前重建；每个模式只取首次命中，
//! 命中数达到上限即停止。按字符（而非字节）比较，中文可直接匹配。

use std::collections::HashMap;

/// 一次命中
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    /// 命中位置（字符下标）
    pub index: usize,
    pub word: String,
}

#[derive(Debug, Default)]
pub struct HorspoolMatcher {
    shift: HashMap<char, usize>,
}

impl HorspoolMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在 text 中依次查找各模式，最多返回 max_hits 个命中
    pub fn search(&mut self, text: &str, patterns: &[String], max_hits: usize) -> Vec<Hit> {
        let text: Vec<char> = text.chars().collect();
        let mut hits = Vec::new();
        if max_hits == 0 {
            return hits;
        }
        for word in patterns {
            let pattern: Vec<char> = word.chars().collect();
            if let Some(index) = self.find(&text, &pattern) {
                hits.push(Hit {
                    index,
                    word: word.clone(),
                });
                if hits.len() >= max_hits {
                    break;
                }
            }
        }
        hits
    }

    fn find(&mut self, text: &[char], pattern: &[char]) -> Option<usize> {
        let m = pattern.len();
        let n = text.len();
        if m == 0 || m > n {
            return None;
        }

        self.shift.clear();
        for (i, c) in pattern.iter().enumerate().take(m - 1) {
            self.shift.insert(*c, m - 1 - i);
        }

        let mut pos = 0;
        while pos + m <= n {
            let mut j = m - 1;
            while text[pos + j] == pattern[j] {
                if j == 0 {
                    return Some(pos);
                }
                j -= 1;
            }
            pos += self.shift.get(&text[pos + m - 1]).copied().unwrap_or(m);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_chinese_trigger_found() {
        let mut m = HorspoolMatcher::new();
        let hits = m.search("今天天气怎么样", &words(&["天气", "weather"]), 10);
        assert_eq!(hits, vec![Hit { index: 2, word: "天气".into() }]);
    }

    #[test]
    fn test_empty_and_oversized_patterns_skipped() {
        let mut m = HorspoolMatcher::new();
        let hits = m.search("abc", &words(&["", "abcdef", "c"]), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].word, "c");
    }

    #[test]
    fn test_hit_cap() {
        let mut m = HorspoolMatcher::new();
        let hits = m.search("abcdef", &words(&["a", "b", "c", "d"]), 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].word, "b");
    }

    #[test]
    fn test_shift_table_reused_across_patterns() {
        let mut m = HorspoolMatcher::new();
        let text = "the weather in abcabd";
        let hits = m.search(text, &words(&["abd", "eat", "xyz"]), 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index, 18);
        assert_eq!(hits[1].index, 5);
    }
}
